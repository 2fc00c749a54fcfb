//! Launcher reconciliation scenarios over the in-memory store.

use std::sync::Arc;

use fleetd::entity::{Entity, EntityId};
use fleetd::launcher::DeploymentLauncher;
use fleetd::model::{
    kind, label, App, AppVersion, SandboxPool, ServiceConcurrency, ServiceConfig, VersionConfig,
};
use fleetd::reconciler::{ReconcileCtx, Reconciler};
use fleetd::store::{EntityStore, MemoryStore};

fn app_id() -> EntityId {
    EntityId::new(kind::APP, "blog")
}

fn postgres_service(image: Option<&str>, num_instances: u32) -> ServiceConfig {
    ServiceConfig {
        name: "postgres".to_string(),
        image: image.map(|s| s.to_string()),
        disks: vec![],
        concurrency: ServiceConcurrency::fixed(num_instances),
    }
}

async fn put_version(store: &MemoryStore, name: &str, services: Vec<ServiceConfig>) -> EntityId {
    let version = AppVersion {
        id: EntityId::new(kind::APP_VERSION, name),
        revision: 0,
        app: app_id(),
        version: name.to_string(),
        image_url: "postgres".to_string(),
        config: VersionConfig {
            services,
            ..Default::default()
        },
    };
    let (id, _) = store
        .put(Some(version.id.clone()), kind::APP_VERSION, version.encode())
        .await
        .unwrap();
    id
}

async fn set_active(store: &MemoryStore, version: &EntityId) {
    let app = App {
        id: app_id(),
        revision: 0,
        project: "demo".to_string(),
        active_version: Some(version.clone()),
    };
    store
        .put(Some(app_id()), kind::APP, app.encode())
        .await
        .unwrap();
}

async fn reconcile(store: &Arc<MemoryStore>) {
    let launcher = DeploymentLauncher::new();
    let ctx = ReconcileCtx::new(store.clone() as Arc<dyn EntityStore>);
    let entity = store.get(&app_id()).await.unwrap();
    launcher.reconcile(entity, &ctx).await.unwrap();
}

async fn pools(store: &MemoryStore) -> Vec<SandboxPool> {
    store
        .list(kind::SANDBOX_POOL)
        .await
        .unwrap()
        .iter()
        .map(|e| SandboxPool::decode(e).unwrap())
        .collect()
}

async fn pool_entities(store: &MemoryStore) -> Vec<Entity> {
    store.list(kind::SANDBOX_POOL).await.unwrap()
}

#[tokio::test]
async fn test_fixed_cold_start() {
    let store = Arc::new(MemoryStore::new());
    let v1 = put_version(&store, "v1", vec![postgres_service(None, 2)]).await;
    set_active(&store, &v1).await;

    reconcile(&store).await;

    let pools = pools(&store).await;
    assert_eq!(pools.len(), 1);
    let pool = &pools[0];
    assert_eq!(pool.service, "postgres");
    assert_eq!(pool.desired_instances, 2);
    assert_eq!(pool.referenced_by_versions, vec![v1]);
    assert_eq!(pool.label(label::APP), Some(app_id().as_str()));
    assert_eq!(pool.label(label::SERVICE), Some("postgres"));
    assert_eq!(pool.label(label::VERSION), Some("v1"));
    assert_eq!(pool.spec.containers.len(), 1);
    assert_eq!(pool.spec.containers[0].image, "postgres");
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let v1 = put_version(&store, "v1", vec![postgres_service(None, 2)]).await;
    set_active(&store, &v1).await;

    reconcile(&store).await;
    let first = pool_entities(&store).await;
    reconcile(&store).await;
    let second = pool_entities(&store).await;
    // No external change: the second pass writes nothing, revisions included.
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_pool_reuse_on_concurrency_only_change() {
    let store = Arc::new(MemoryStore::new());
    let v1 = put_version(&store, "v1", vec![postgres_service(None, 2)]).await;
    set_active(&store, &v1).await;
    reconcile(&store).await;

    // Same template; only the instance count changed.
    let v2 = put_version(&store, "v2", vec![postgres_service(None, 3)]).await;
    set_active(&store, &v2).await;
    reconcile(&store).await;

    let pools = pools(&store).await;
    assert_eq!(pools.len(), 1, "the pool is reused, not replaced");
    let pool = &pools[0];
    assert!(pool.references_version(&v1));
    assert!(pool.references_version(&v2));
    assert_eq!(pool.referenced_by_versions.len(), 2);
    // The launcher leaves the instance count alone on reuse.
    assert_eq!(pool.desired_instances, 2);
}

#[tokio::test]
async fn test_new_pool_on_image_change() {
    let store = Arc::new(MemoryStore::new());
    let v1 = put_version(&store, "v1", vec![postgres_service(None, 2)]).await;
    set_active(&store, &v1).await;
    reconcile(&store).await;

    let v2 = put_version(&store, "v2", vec![postgres_service(Some("postgres:17"), 2)]).await;
    set_active(&store, &v2).await;
    reconcile(&store).await;

    let pools = pools(&store).await;
    assert_eq!(pools.len(), 2);

    let old = pools
        .iter()
        .find(|p| p.spec.containers[0].image == "postgres")
        .expect("old pool still exists");
    let new = pools
        .iter()
        .find(|p| p.spec.containers[0].image == "postgres:17")
        .expect("new pool created");

    // The orphan is dereferenced and scaled down, but not deleted.
    assert!(old.referenced_by_versions.is_empty());
    assert_eq!(old.desired_instances, 0);

    assert_eq!(new.referenced_by_versions, vec![v2]);
    assert_eq!(new.desired_instances, 2);
    assert!(!old.references_version(&v1));
}

#[tokio::test]
async fn test_reuse_survives_latest_tag_spelling() {
    let store = Arc::new(MemoryStore::new());
    // v1 spells the image without a tag, v2 with an explicit :latest.
    let v1 = put_version(&store, "v1", vec![postgres_service(Some("postgres"), 1)]).await;
    set_active(&store, &v1).await;
    reconcile(&store).await;

    let v2 = put_version(&store, "v2", vec![postgres_service(Some("postgres:latest"), 1)]).await;
    set_active(&store, &v2).await;
    reconcile(&store).await;

    let pools = pools(&store).await;
    assert_eq!(pools.len(), 1, "tag normalisation keeps the templates equal");
    assert!(pools[0].references_version(&v1));
    assert!(pools[0].references_version(&v2));
}

#[tokio::test]
async fn test_multi_service_versions_get_a_pool_each() {
    let store = Arc::new(MemoryStore::new());
    let web = ServiceConfig {
        name: "web".to_string(),
        image: None,
        disks: vec![],
        concurrency: ServiceConcurrency::auto(10, std::time::Duration::from_secs(60)),
    };
    let v1 = put_version(&store, "v1", vec![postgres_service(None, 1), web]).await;
    set_active(&store, &v1).await;
    reconcile(&store).await;

    let pools = pools(&store).await;
    assert_eq!(pools.len(), 2);
    let postgres = pools.iter().find(|p| p.service == "postgres").unwrap();
    let web = pools.iter().find(|p| p.service == "web").unwrap();
    assert_eq!(postgres.desired_instances, 1);
    // Auto-mode services launch scaled to zero.
    assert_eq!(web.desired_instances, 0);
}

#[tokio::test]
async fn test_app_without_active_version_is_a_noop() {
    let store = Arc::new(MemoryStore::new());
    let app = App {
        id: app_id(),
        revision: 0,
        project: "demo".to_string(),
        active_version: None,
    };
    store
        .put(Some(app_id()), kind::APP, app.encode())
        .await
        .unwrap();

    reconcile(&store).await;
    assert!(pools(&store).await.is_empty());
}
