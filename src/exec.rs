//! Exec sessions.
//!
//! Runs an interactive command against a sandbox. For `target=app` the
//! runner creates a one-off ephemeral sandbox from the app's active version,
//! waits (bounded) for it to come up, tunnels the session to the node it was
//! bound to, and deletes the sandbox on return. The node agent itself is an
//! external collaborator behind [`NodeClient`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::daemon::ExecFrame;
use crate::entity::EntityId;
use crate::launcher::desired_sandbox_spec;
use crate::model::{
    kind, label, App, AppVersion, Node, Sandbox, SandboxStatus, Schedule, ServiceConcurrency,
    ServiceConfig, DEFAULT_SERVICE,
};
use crate::store::EntityStore;

/// How long an ephemeral sandbox gets to reach `running`.
pub const EXEC_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Caller-side input to a session.
#[derive(Debug)]
pub enum ExecInput {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Close,
}

/// Connection to a node's agent.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Tunnel a session to the agent at `api_address`: forward stdin and
    /// window updates, stream stdout back, return the exit code.
    async fn exec(
        &self,
        api_address: &str,
        sandbox: &EntityId,
        command: &[String],
        input: mpsc::Receiver<ExecInput>,
        output: mpsc::Sender<Vec<u8>>,
    ) -> Result<i32>;
}

/// Opening line of a node exec connection.
#[derive(Debug, Serialize, Deserialize)]
struct NodeExecStart {
    sandbox: String,
    command: Vec<String>,
}

/// Node agent client speaking newline-delimited JSON over TCP.
#[derive(Debug, Default)]
pub struct TcpNodeClient;

impl TcpNodeClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NodeClient for TcpNodeClient {
    async fn exec(
        &self,
        api_address: &str,
        sandbox: &EntityId,
        command: &[String],
        mut input: mpsc::Receiver<ExecInput>,
        output: mpsc::Sender<Vec<u8>>,
    ) -> Result<i32> {
        let stream = TcpStream::connect(api_address)
            .await
            .with_context(|| format!("connecting to node agent at {}", api_address))?;
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let start = NodeExecStart {
            sandbox: sandbox.to_string(),
            command: command.to_vec(),
        };
        writer
            .write_all((serde_json::to_string(&start)? + "\n").as_bytes())
            .await?;

        let mut input_open = true;
        loop {
            tokio::select! {
                frame = input.recv(), if input_open => {
                    let frame = match frame {
                        Some(ExecInput::Data(data)) => ExecFrame::Stdin {
                            data: BASE64.encode(&data),
                        },
                        Some(ExecInput::Resize { cols, rows }) => ExecFrame::Resize { cols, rows },
                        Some(ExecInput::Close) | None => {
                            input_open = false;
                            ExecFrame::StdinClose
                        }
                    };
                    writer
                        .write_all((serde_json::to_string(&frame)? + "\n").as_bytes())
                        .await?;
                }
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        bail!("node agent at {} closed the session early", api_address);
                    };
                    match serde_json::from_str::<ExecFrame>(&line)? {
                        ExecFrame::Stdout { data } => {
                            let bytes = BASE64.decode(data.as_bytes())?;
                            // A vanished caller still drains until exit.
                            let _ = output.send(bytes).await;
                        }
                        ExecFrame::Exit { code } => return Ok(code),
                        ExecFrame::Aborted { message } => bail!("node agent aborted: {}", message),
                        other => bail!("unexpected frame from node agent: {other:?}"),
                    }
                }
            }
        }
    }
}

/// Runs exec sessions against sandboxes, creating ephemeral ones for apps.
pub struct ExecRunner {
    store: Arc<dyn EntityStore>,
    nodes: Arc<dyn NodeClient>,
    ready_timeout: Duration,
}

impl ExecRunner {
    pub fn new(store: Arc<dyn EntityStore>, nodes: Arc<dyn NodeClient>) -> Self {
        Self {
            store,
            nodes,
            ready_timeout: EXEC_READY_TIMEOUT,
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Run in a one-off sandbox of the app's active version. The sandbox is
    /// deleted on return, error paths included.
    pub async fn exec_in_app(
        &self,
        app_id: &EntityId,
        command: &[String],
        input: mpsc::Receiver<ExecInput>,
        output: mpsc::Sender<Vec<u8>>,
    ) -> Result<i32> {
        let sandbox_id = self.create_ephemeral(app_id).await?;
        info!(sandbox = %sandbox_id, app = %app_id, "ephemeral sandbox created");

        let result = async {
            self.wait_running(&sandbox_id).await?;
            self.exec_in_sandbox(&sandbox_id, command, input, output).await
        }
        .await;

        if let Err(e) = self.store.delete(&sandbox_id).await {
            warn!(sandbox = %sandbox_id, error = %e, "ephemeral sandbox cleanup failed");
        }
        result
    }

    /// Run against an existing sandbox via the node it is bound to.
    pub async fn exec_in_sandbox(
        &self,
        sandbox_id: &EntityId,
        command: &[String],
        input: mpsc::Receiver<ExecInput>,
        output: mpsc::Sender<Vec<u8>>,
    ) -> Result<i32> {
        let entity = self.store.get(sandbox_id).await?;
        let schedule = Schedule::decode(&entity)
            .with_context(|| format!("sandbox {} is not bound to a node yet", sandbox_id))?;
        let node = Node::decode(&self.store.get(&schedule.node).await?)?;
        if node.api_address.is_empty() {
            bail!("node {} has no api address", node.id);
        }
        self.nodes
            .exec(&node.api_address, sandbox_id, command, input, output)
            .await
    }

    async fn create_ephemeral(&self, app_id: &EntityId) -> Result<EntityId> {
        let app = App::decode(&self.store.get(app_id).await?)?;
        let version_id = app
            .active_version
            .clone()
            .with_context(|| format!("app {} has no active version", app_id))?;
        let version = AppVersion::decode(&self.store.get(&version_id).await?)?;
        let service = version.service(DEFAULT_SERVICE).cloned().unwrap_or(ServiceConfig {
            name: DEFAULT_SERVICE.to_string(),
            image: None,
            disks: vec![],
            concurrency: ServiceConcurrency::default(),
        });

        let sandbox = Sandbox {
            id: EntityId::random(kind::SANDBOX),
            revision: 0,
            spec: desired_sandbox_spec(&app, &version, &service),
            status: SandboxStatus::Pending,
            network: vec![],
            last_activity: None,
            labels: vec![
                (label::EPHEMERAL.to_string(), "true".to_string()),
                (label::APP.to_string(), app.id.as_str().to_string()),
                (label::SERVICE.to_string(), service.name.clone()),
            ],
        };
        let (id, _) = self
            .store
            .put(Some(sandbox.id.clone()), kind::SANDBOX, sandbox.encode())
            .await?;
        Ok(id)
    }

    async fn wait_running(&self, id: &EntityId) -> Result<()> {
        let mut watch = self.store.watch(id).await?;
        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        loop {
            let entity = self.store.get(id).await?;
            let sandbox = Sandbox::decode(&entity)?;
            match sandbox.status {
                SandboxStatus::Running => return Ok(()),
                status if status.is_terminal() => {
                    bail!("sandbox {} went {} before serving", id, status.as_str())
                }
                _ => {}
            }
            match tokio::time::timeout_at(deadline, watch.recv()).await {
                Ok(Some(_)) => {}
                Ok(None) => bail!("watch on sandbox {} ended", id),
                Err(_) => bail!(
                    "sandbox {} not running after {:?}",
                    id,
                    self.ready_timeout
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Attr;
    use crate::model::VersionConfig;
    use crate::store::MemoryStore;

    struct FakeNode {
        exit_code: i32,
    }

    #[async_trait]
    impl NodeClient for FakeNode {
        async fn exec(
            &self,
            _api_address: &str,
            _sandbox: &EntityId,
            _command: &[String],
            _input: mpsc::Receiver<ExecInput>,
            output: mpsc::Sender<Vec<u8>>,
        ) -> Result<i32> {
            let _ = output.send(b"hello\n".to_vec()).await;
            Ok(self.exit_code)
        }
    }

    async fn seed_app(store: &MemoryStore) -> EntityId {
        let app_id = EntityId::new(kind::APP, "blog");
        let version = AppVersion {
            id: EntityId::new(kind::APP_VERSION, "v1"),
            revision: 0,
            app: app_id.clone(),
            version: "v1".to_string(),
            image_url: "registry.example/blog".to_string(),
            config: VersionConfig::default(),
        };
        store
            .put(Some(version.id.clone()), kind::APP_VERSION, version.encode())
            .await
            .unwrap();
        let app = App {
            id: app_id.clone(),
            revision: 0,
            project: "demo".to_string(),
            active_version: Some(version.id),
        };
        store
            .put(Some(app_id.clone()), kind::APP, app.encode())
            .await
            .unwrap();
        app_id
    }

    fn runner(store: &Arc<MemoryStore>, nodes: Arc<dyn NodeClient>) -> ExecRunner {
        ExecRunner::new(store.clone() as Arc<dyn EntityStore>, nodes)
    }

    #[tokio::test]
    async fn test_ephemeral_sandbox_labels() {
        let store = Arc::new(MemoryStore::new());
        let app_id = seed_app(&store).await;
        let runner = runner(&store, Arc::new(FakeNode { exit_code: 0 }));

        let id = runner.create_ephemeral(&app_id).await.unwrap();
        let entity = store.get(&id).await.unwrap();
        let sandbox = Sandbox::decode(&entity).unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Pending);
        assert_eq!(sandbox.label(label::EPHEMERAL), Some("true"));
        assert_eq!(sandbox.service(), "web");
        assert!(sandbox.pool().is_none());
        assert_eq!(sandbox.spec.version, Some(EntityId::new(kind::APP_VERSION, "v1")));
    }

    #[tokio::test]
    async fn test_exec_in_app_runs_and_cleans_up() {
        let store = Arc::new(MemoryStore::new());
        let app_id = seed_app(&store).await;
        // A node the ephemeral sandbox will be bound to.
        let node = Node {
            id: EntityId::new(kind::NODE, "n1"),
            revision: 0,
            api_address: "10.0.0.1:7100".to_string(),
            constraints: vec![],
            status: crate::model::NodeStatus::Ready,
        };
        store
            .put(Some(node.id.clone()), kind::NODE, node.encode())
            .await
            .unwrap();

        let runner = runner(&store, Arc::new(FakeNode { exit_code: 7 }))
            .with_ready_timeout(Duration::from_secs(2));

        // Play the node agent's part: bind and start whatever sandbox shows
        // up, shortly after creation.
        let mut sandbox_watch = store.watch_index(kind::SANDBOX).await.unwrap();
        let agent_store = store.clone();
        let agent = tokio::spawn(async move {
            let watch = &mut sandbox_watch;
            while let Some(event) = watch.recv().await {
                let Some(entity) = event.entity else { continue };
                if Schedule::decode(&entity).is_none() {
                    let schedule = Schedule::for_node(EntityId::new(kind::NODE, "n1"));
                    let rev = agent_store
                        .patch(&entity.id, vec![schedule.encode()], entity.revision)
                        .await
                        .unwrap();
                    agent_store
                        .patch(&entity.id, vec![Attr::str("status", "running")], rev)
                        .await
                        .unwrap();
                    break;
                }
            }
        });

        let (_in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let code = runner
            .exec_in_app(&app_id, &["echo".to_string(), "hello".to_string()], in_rx, out_tx)
            .await
            .unwrap();
        assert_eq!(code, 7);
        assert_eq!(out_rx.recv().await.unwrap(), b"hello\n".to_vec());

        // The ephemeral sandbox is gone afterwards.
        let sandboxes = store.list(kind::SANDBOX).await.unwrap();
        assert!(sandboxes.is_empty());
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_in_app_times_out_and_cleans_up() {
        let store = Arc::new(MemoryStore::new());
        let app_id = seed_app(&store).await;
        let runner = runner(&store, Arc::new(FakeNode { exit_code: 0 }))
            .with_ready_timeout(Duration::from_millis(100));

        let (_in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, _out_rx) = mpsc::channel(4);
        let err = runner
            .exec_in_app(&app_id, &["true".to_string()], in_rx, out_tx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not running"));
        assert!(store.list(kind::SANDBOX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exec_requires_schedule() {
        let store = Arc::new(MemoryStore::new());
        seed_app(&store).await;
        let (id, _) = store
            .put(None, kind::SANDBOX, vec![Attr::str("status", "running")])
            .await
            .unwrap();
        let runner = runner(&store, Arc::new(FakeNode { exit_code: 0 }));

        let (_in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, _out_rx) = mpsc::channel(4);
        let err = runner
            .exec_in_sandbox(&id, &["true".to_string()], in_rx, out_tx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not bound to a node"));
    }
}
