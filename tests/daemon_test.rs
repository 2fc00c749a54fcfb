//! RPC surface tests: Unix-socket daemon, client, and the node exec tunnel.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use fleetd::activator::{Activator, ActivatorConfig};
use fleetd::daemon::{DaemonClient, DaemonServer, ExecFrame, ExecTargetRef};
use fleetd::entity::EntityId;
use fleetd::exec::{ExecRunner, TcpNodeClient};
use fleetd::model::{
    kind, label, AppVersion, Node, NodeStatus, Sandbox, SandboxPool, SandboxSpec, SandboxStatus,
    Schedule, ServiceConcurrency, ServiceConfig, VersionConfig,
};
use fleetd::store::{EntityStore, MemoryStore};

fn v1() -> EntityId {
    EntityId::new(kind::APP_VERSION, "v1")
}

async fn seed_serving_stack(store: &MemoryStore) {
    let version = AppVersion {
        id: v1(),
        revision: 0,
        app: EntityId::new(kind::APP, "blog"),
        version: "v1".to_string(),
        image_url: "registry.example/blog".to_string(),
        config: VersionConfig {
            services: vec![ServiceConfig {
                name: "web".to_string(),
                image: None,
                disks: vec![],
                concurrency: ServiceConcurrency::auto(10, Duration::from_secs(60)),
            }],
            ..Default::default()
        },
    };
    store
        .put(Some(v1()), kind::APP_VERSION, version.encode())
        .await
        .unwrap();

    let pool = SandboxPool {
        id: EntityId::new(kind::SANDBOX_POOL, "p1"),
        revision: 0,
        service: "web".to_string(),
        spec: SandboxSpec {
            version: Some(v1()),
            ..Default::default()
        },
        desired_instances: 1,
        current_instances: 1,
        ready_instances: 1,
        referenced_by_versions: vec![v1()],
        labels: vec![],
    };
    store
        .put(Some(pool.id.clone()), kind::SANDBOX_POOL, pool.encode())
        .await
        .unwrap();

    let sandbox = Sandbox {
        id: EntityId::new(kind::SANDBOX, "s1"),
        revision: 0,
        spec: SandboxSpec {
            version: Some(v1()),
            ..Default::default()
        },
        status: SandboxStatus::Running,
        network: vec!["10.0.0.5/24".to_string()],
        last_activity: None,
        labels: vec![
            (label::SERVICE.to_string(), "web".to_string()),
            (
                label::POOL.to_string(),
                EntityId::new(kind::SANDBOX_POOL, "p1").as_str().to_string(),
            ),
        ],
    };
    store
        .put(Some(sandbox.id.clone()), kind::SANDBOX, sandbox.encode())
        .await
        .unwrap();
}

struct TestDaemon {
    client: DaemonClient,
    activator: Arc<Activator>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
    _dir: tempfile::TempDir,
}

async fn start_daemon(store: Arc<MemoryStore>) -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("daemon.sock");

    let activator = Activator::new(
        store.clone() as Arc<dyn EntityStore>,
        ActivatorConfig::default(),
    )
    .await
    .unwrap();
    activator.start();

    let exec = Arc::new(ExecRunner::new(
        store as Arc<dyn EntityStore>,
        Arc::new(TcpNodeClient::new()),
    ));
    let server = DaemonServer::new(Arc::clone(&activator), exec).with_socket_path(socket.clone());
    let server = tokio::spawn(async move { server.run().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    TestDaemon {
        client: DaemonClient::with_socket_path(socket),
        activator,
        server,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_lease_rpc_roundtrip() {
    let store = Arc::new(MemoryStore::new());
    seed_serving_stack(&store).await;
    let daemon = start_daemon(store).await;
    assert!(daemon.client.is_available());

    let lease = daemon
        .client
        .acquire_lease(v1().as_str(), "web", Some(2000))
        .await
        .unwrap();
    assert_eq!(lease.url, "http://10.0.0.5:3000");
    assert_eq!(lease.size, 2);
    assert_eq!(lease.sandbox, "sandbox/s1");

    let renewed = daemon.client.renew_lease(lease.clone()).await.unwrap();
    assert_eq!(renewed.sandbox, lease.sandbox);

    let pools = daemon.client.status().await.unwrap();
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].running, 1);
    assert_eq!(pools[0].slots_used, 2);

    daemon.client.release_lease(lease).await.unwrap();
    let pools = daemon.client.status().await.unwrap();
    assert_eq!(pools[0].slots_used, 0);

    daemon.client.shutdown().await.unwrap();
    daemon.server.await.unwrap().unwrap();
    daemon.activator.shutdown();
}

#[tokio::test]
async fn test_acquire_error_carries_a_kind() {
    let store = Arc::new(MemoryStore::new());
    let daemon = start_daemon(store).await;

    let err = daemon
        .client
        .acquire_lease("appVersion/ghost", "web", Some(500))
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("PoolNotFound"),
        "caller can branch on the kind: {err}"
    );

    daemon.client.shutdown().await.unwrap();
    daemon.server.await.unwrap().unwrap();
    daemon.activator.shutdown();
}

#[tokio::test]
async fn test_exec_tunnels_to_the_bound_node() {
    // A fake node agent on a real TCP socket.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let agent = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        // Opening line names the sandbox and command.
        let start = lines.next_line().await.unwrap().unwrap();
        assert!(start.contains("sandbox/s1"));
        assert!(start.contains("uname"));

        for frame in [
            ExecFrame::Stdout {
                data: BASE64.encode(b"Linux\n"),
            },
            ExecFrame::Exit { code: 3 },
        ] {
            let json = serde_json::to_string(&frame).unwrap() + "\n";
            writer.write_all(json.as_bytes()).await.unwrap();
        }
    });

    let store = Arc::new(MemoryStore::new());
    seed_serving_stack(&store).await;
    // Bind the sandbox to the fake node.
    let node = Node {
        id: EntityId::new(kind::NODE, "n1"),
        revision: 0,
        api_address: addr,
        constraints: vec![],
        status: NodeStatus::Ready,
    };
    store
        .put(Some(node.id.clone()), kind::NODE, node.encode())
        .await
        .unwrap();
    let sandbox_id = EntityId::new(kind::SANDBOX, "s1");
    let entity = store.get(&sandbox_id).await.unwrap();
    store
        .patch(
            &sandbox_id,
            vec![Schedule::for_node(node.id.clone()).encode()],
            entity.revision,
        )
        .await
        .unwrap();

    let daemon = start_daemon(store).await;
    let code = daemon
        .client
        .exec(
            ExecTargetRef::Sandbox("sandbox/s1".to_string()),
            vec!["uname".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(code, 3);
    agent.await.unwrap();

    daemon.client.shutdown().await.unwrap();
    daemon.server.await.unwrap().unwrap();
    daemon.activator.shutdown();
}

#[tokio::test]
async fn test_malformed_request_gets_an_error_response() {
    let store = Arc::new(MemoryStore::new());
    let daemon = start_daemon(store).await;

    let stream = tokio::net::UnixStream::connect(daemon.client.socket_path())
        .await
        .unwrap();
    let (reader, mut writer) = stream.into_split();
    writer.write_all(b"{\"cmd\":\"nonsense\"}\n").await.unwrap();
    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await.unwrap();
    assert!(line.contains("\"type\":\"error\""));
    assert!(line.contains("invalid request"));

    daemon.client.shutdown().await.unwrap();
    daemon.server.await.unwrap().unwrap();
    daemon.activator.shutdown();
}
