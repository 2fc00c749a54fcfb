//! Deployment launcher.
//!
//! Translates an app's active version into pool entities, one per declared
//! service, reusing an existing pool whenever the effective sandbox template
//! is unchanged. Pools left behind by a deploy are dereferenced and scaled
//! to zero; deleting the drained entity is the janitor's job, not ours.

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::entity::{Entity, EntityId};
use crate::model::{
    kind, label, App, AppVersion, ContainerSpec, EnvVar, MountSpec, SandboxPool, SandboxSpec,
    ServiceConfig, VolumeSpec, ENV_APP, ENV_VERSION,
};
use crate::reconciler::{ReconcileCtx, Reconciler};
use crate::strategy::Strategy;

/// Strip an explicit `latest` tag; the tag is implicit. Only the segment
/// after the last `/` is a tag, so registry ports survive.
pub fn normalize_image(image: &str) -> String {
    if let Some((base, tag)) = image.rsplit_once(':') {
        if tag == "latest" && !tag.contains('/') {
            return base.to_string();
        }
    }
    image.to_string()
}

/// The sandbox template a (app, version, service) triple should run.
pub fn desired_sandbox_spec(app: &App, version: &AppVersion, service: &ServiceConfig) -> SandboxSpec {
    let image = normalize_image(service.image.as_deref().unwrap_or(&version.image_url));
    let port = version.config.port();

    let mut env = vec![
        EnvVar::new(ENV_APP, app.id.name()),
        EnvVar::new(ENV_VERSION, version.version.clone()),
    ];
    env.extend(version.config.env.iter().cloned());

    let mut command = version.config.entrypoint.clone();
    if let Some(args) = version.config.commands.get(&service.name) {
        command.extend(args.iter().cloned());
    }

    // Disks only materialize for fixed-mode services; auto-mode sandboxes are
    // interchangeable and get no stable storage.
    let (volumes, mounts) = if service.concurrency.mode == crate::model::ConcurrencyMode::Fixed {
        (
            service
                .disks
                .iter()
                .map(|d| VolumeSpec { name: d.name.clone() })
                .collect(),
            service
                .disks
                .iter()
                .map(|d| MountSpec {
                    volume: d.name.clone(),
                    path: d.path.clone(),
                })
                .collect(),
        )
    } else {
        (Vec::new(), Vec::new())
    };

    SandboxSpec {
        version: Some(version.id.clone()),
        containers: vec![ContainerSpec {
            name: "app".to_string(),
            image,
            command,
            dir: None,
            env,
            ports: vec![port],
            mounts,
        }],
        volumes,
        log_entity: Some(app.id.clone()),
        log_attrs: vec![
            (label::STAGE.to_string(), "app-run".to_string()),
            (label::SERVICE.to_string(), service.name.clone()),
        ],
    }
}

pub struct DeploymentLauncher;

impl DeploymentLauncher {
    pub fn new() -> Self {
        Self
    }

    async fn ensure_pool(
        &self,
        ctx: &ReconcileCtx,
        app: &App,
        version: &AppVersion,
        service: &ServiceConfig,
        pools: &[SandboxPool],
    ) -> anyhow::Result<()> {
        let desired = desired_sandbox_spec(app, version, service);
        let strategy = Strategy::for_service(&service.concurrency);

        let existing = pools.iter().find(|p| {
            p.service == service.name
                && p.label(label::APP) == Some(app.id.as_str())
                && p.spec.equivalent(&desired)
        });

        match existing {
            Some(pool) => {
                if pool.references_version(&version.id) {
                    debug!(pool = %pool.id, version = %version.id, "pool already referenced");
                    return Ok(());
                }
                let mut updated = pool.clone();
                updated.referenced_by_versions.push(version.id.clone());
                ctx.store()
                    .replace(&pool.id, updated.encode_with_zeros(), pool.revision)
                    .await
                    .with_context(|| format!("adding version reference to pool {}", pool.id))?;
                info!(
                    pool = %pool.id,
                    service = %service.name,
                    version = %version.id,
                    "reusing pool for new version"
                );
            }
            None => {
                let pool = SandboxPool {
                    id: EntityId::random(kind::SANDBOX_POOL),
                    revision: 0,
                    service: service.name.clone(),
                    spec: desired,
                    desired_instances: strategy.initial_instances(),
                    current_instances: 0,
                    ready_instances: 0,
                    referenced_by_versions: vec![version.id.clone()],
                    labels: vec![
                        (label::APP.to_string(), app.id.as_str().to_string()),
                        (label::VERSION.to_string(), version.version.clone()),
                        (label::SERVICE.to_string(), service.name.clone()),
                    ],
                };
                let (id, _) = ctx
                    .store()
                    .put(Some(pool.id.clone()), kind::SANDBOX_POOL, pool.encode())
                    .await
                    .with_context(|| format!("creating pool for service {}", service.name))?;
                info!(
                    pool = %id,
                    service = %service.name,
                    desired = pool.desired_instances,
                    "pool created"
                );
            }
        }
        Ok(())
    }

    /// Scale down every pool of this app that no longer serves the active
    /// version. Pools still referencing the active version keep their older
    /// references too: that window is what makes reuse cheap.
    async fn cleanup_orphans(
        &self,
        ctx: &ReconcileCtx,
        app: &App,
        active_version: &EntityId,
    ) -> anyhow::Result<()> {
        let entities = ctx.store().list(kind::SANDBOX_POOL).await?;
        for entity in entities {
            let pool = match SandboxPool::decode(&entity) {
                Ok(pool) => pool,
                Err(e) => {
                    warn!(error = %e, "skipping undecodable pool");
                    continue;
                }
            };
            if pool.label(label::APP) != Some(app.id.as_str()) {
                continue;
            }
            if pool.references_version(active_version) {
                continue;
            }
            if pool.referenced_by_versions.is_empty() && pool.desired_instances == 0 {
                continue;
            }

            let mut updated = pool.clone();
            updated.referenced_by_versions.clear();
            updated.desired_instances = 0;
            match ctx
                .store()
                .replace(&pool.id, updated.encode_with_zeros(), pool.revision)
                .await
            {
                Ok(_) => info!(pool = %pool.id, "orphaned pool scaled down"),
                Err(e) if e.is_conflict() => {
                    debug!(pool = %pool.id, "pool moved during cleanup, deferring");
                }
                Err(e) => warn!(pool = %pool.id, error = %e, "orphan scale-down failed"),
            }
        }
        Ok(())
    }
}

impl Default for DeploymentLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reconciler for DeploymentLauncher {
    fn kind(&self) -> &'static str {
        kind::APP
    }

    async fn reconcile(&self, entity: Entity, ctx: &ReconcileCtx) -> anyhow::Result<()> {
        let app = match App::decode(&entity) {
            Ok(app) => app,
            Err(e) => {
                warn!(error = %e, "skipping undecodable app");
                return Ok(());
            }
        };
        let Some(version_id) = app.active_version.clone() else {
            debug!(app = %app.id, "no active version");
            return Ok(());
        };

        let version_entity = ctx
            .get(&version_id)
            .await
            .with_context(|| format!("fetching active version {}", version_id))?;
        let version = AppVersion::decode(&version_entity)?;

        let mut pools = Vec::new();
        for entity in ctx.store().list(kind::SANDBOX_POOL).await? {
            match SandboxPool::decode(&entity) {
                Ok(pool) => pools.push(pool),
                Err(e) => warn!(error = %e, "skipping undecodable pool"),
            }
        }

        for service in &version.config.services {
            if let Err(e) = self.ensure_pool(ctx, &app, &version, service, &pools).await {
                warn!(
                    app = %app.id,
                    service = %service.name,
                    error = %e,
                    "ensure pool failed"
                );
            }
        }

        if let Err(e) = self.cleanup_orphans(ctx, &app, &version_id).await {
            warn!(app = %app.id, error = %e, "orphan cleanup failed");
        }
        Ok(())
    }
}
