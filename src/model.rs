//! Typed views over the stored kinds.
//!
//! The store itself is attribute-typed and loose; these types are the strict
//! decode of what the orchestrator needs. Decoding never panics: a missing or
//! mistyped required attribute yields a [`DecodeError`] and the caller logs
//! and skips the entity.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::entity::{Attr, AttrView, Entity, EntityId, Value};

/// Entity kinds.
pub mod kind {
    pub const APP: &str = "app";
    pub const APP_VERSION: &str = "appVersion";
    pub const SANDBOX_POOL: &str = "sandboxPool";
    pub const SANDBOX: &str = "sandbox";
    pub const NODE: &str = "node";
}

/// Protocol labels, compared as strings.
pub mod label {
    pub const APP: &str = "app";
    pub const VERSION: &str = "version";
    pub const SERVICE: &str = "service";
    pub const POOL: &str = "pool";
    pub const EPHEMERAL: &str = "ephemeral";
    pub const STAGE: &str = "stage";
}

/// Environment variables injected into every container to encode the version
/// identity. Excluded from spec equivalence.
pub const ENV_APP: &str = "APP";
pub const ENV_VERSION: &str = "VERSION";

/// Port apps listen on when the version config does not say otherwise.
pub const DEFAULT_PORT: u16 = 3000;

/// Service assumed when a sandbox carries no service label.
pub const DEFAULT_SERVICE: &str = "web";

#[derive(Debug, thiserror::Error)]
#[error("{id}: missing or mistyped attribute {attr}")]
pub struct DecodeError {
    pub id: EntityId,
    pub attr: &'static str,
}

fn missing(id: &EntityId, attr: &'static str) -> DecodeError {
    DecodeError {
        id: id.clone(),
        attr,
    }
}

fn collect_labels(attrs: &[Attr]) -> Vec<(String, String)> {
    attrs
        .iter()
        .filter_map(|a| match &a.value {
            Value::Label(v) => Some((a.name.clone(), v.clone())),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

/// User-declared application.
#[derive(Debug, Clone)]
pub struct App {
    pub id: EntityId,
    pub revision: u64,
    pub project: String,
    pub active_version: Option<EntityId>,
}

impl App {
    pub fn decode(entity: &Entity) -> Result<Self, DecodeError> {
        Ok(Self {
            id: entity.id.clone(),
            revision: entity.revision,
            project: entity.str("project").unwrap_or_default().to_string(),
            active_version: entity.reference("activeVersion").cloned(),
        })
    }

    pub fn encode(&self) -> Vec<Attr> {
        let mut attrs = vec![Attr::str("project", self.project.clone())];
        if let Some(v) = &self.active_version {
            attrs.push(Attr::reference("activeVersion", v.clone()));
        }
        attrs
    }
}

// ---------------------------------------------------------------------------
// AppVersion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    fn decode(attrs: &[Attr]) -> Self {
        Self {
            name: attrs.str("name").unwrap_or_default().to_string(),
            value: attrs.str("value").unwrap_or_default().to_string(),
        }
    }

    fn encode(&self) -> Vec<Attr> {
        vec![
            Attr::str("name", self.name.clone()),
            Attr::str("value", self.value.clone()),
        ]
    }
}

/// Capacity mode of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    /// Always-on, constant instance count.
    Fixed,
    /// Scale-from-zero, slot-based leases, idle retirement.
    #[default]
    Auto,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConcurrency {
    pub mode: ConcurrencyMode,
    /// Fixed mode: how many instances to keep.
    pub num_instances: u32,
    /// Auto mode: slot count per sandbox. Zero means the default.
    pub requests_per_instance: u32,
    /// Auto mode: how long a sandbox may idle before retirement.
    pub scale_down_delay: Duration,
}

impl Default for ServiceConcurrency {
    fn default() -> Self {
        Self {
            mode: ConcurrencyMode::Auto,
            num_instances: 0,
            requests_per_instance: 0,
            scale_down_delay: Duration::ZERO,
        }
    }
}

impl ServiceConcurrency {
    pub fn fixed(num_instances: u32) -> Self {
        Self {
            mode: ConcurrencyMode::Fixed,
            num_instances,
            ..Default::default()
        }
    }

    pub fn auto(requests_per_instance: u32, scale_down_delay: Duration) -> Self {
        Self {
            mode: ConcurrencyMode::Auto,
            requests_per_instance,
            scale_down_delay,
            ..Default::default()
        }
    }

    fn decode(attrs: &[Attr]) -> Self {
        let mode = match attrs.str("mode") {
            Some("fixed") => ConcurrencyMode::Fixed,
            _ => ConcurrencyMode::Auto,
        };
        Self {
            mode,
            num_instances: attrs.int("numInstances").unwrap_or(0).max(0) as u32,
            requests_per_instance: attrs.int("requestsPerInstance").unwrap_or(0).max(0) as u32,
            scale_down_delay: Duration::from_secs(
                attrs.int("scaleDownDelaySecs").unwrap_or(0).max(0) as u64,
            ),
        }
    }

    fn encode(&self) -> Vec<Attr> {
        let mode = match self.mode {
            ConcurrencyMode::Fixed => "fixed",
            ConcurrencyMode::Auto => "auto",
        };
        let mut attrs = vec![Attr::str("mode", mode)];
        if self.num_instances > 0 {
            attrs.push(Attr::int("numInstances", self.num_instances as i64));
        }
        if self.requests_per_instance > 0 {
            attrs.push(Attr::int(
                "requestsPerInstance",
                self.requests_per_instance as i64,
            ));
        }
        if !self.scale_down_delay.is_zero() {
            attrs.push(Attr::int(
                "scaleDownDelaySecs",
                self.scale_down_delay.as_secs() as i64,
            ));
        }
        attrs
    }
}

/// A disk declared for a service.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskConfig {
    pub name: String,
    pub path: String,
}

impl DiskConfig {
    fn decode(attrs: &[Attr]) -> Self {
        Self {
            name: attrs.str("name").unwrap_or_default().to_string(),
            path: attrs.str("path").unwrap_or_default().to_string(),
        }
    }

    fn encode(&self) -> Vec<Attr> {
        vec![
            Attr::str("name", self.name.clone()),
            Attr::str("path", self.path.clone()),
        ]
    }
}

/// One declared service of an app version.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    /// Override image; falls back to the version-level image URL.
    pub image: Option<String>,
    pub disks: Vec<DiskConfig>,
    pub concurrency: ServiceConcurrency,
}

impl ServiceConfig {
    fn decode(attrs: &[Attr]) -> Self {
        Self {
            name: attrs.str("name").unwrap_or_default().to_string(),
            image: attrs.str("image").map(|s| s.to_string()),
            disks: attrs.components("disk").into_iter().map(DiskConfig::decode).collect(),
            concurrency: attrs
                .components("concurrency")
                .first()
                .map(|c| ServiceConcurrency::decode(c))
                .unwrap_or_default(),
        }
    }

    fn encode(&self) -> Vec<Attr> {
        let mut attrs = vec![Attr::str("name", self.name.clone())];
        if let Some(image) = &self.image {
            attrs.push(Attr::str("image", image.clone()));
        }
        for disk in &self.disks {
            attrs.push(Attr::component("disk", disk.encode()));
        }
        attrs.push(Attr::component("concurrency", self.concurrency.encode()));
        attrs
    }
}

/// Build configuration attached to an app version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionConfig {
    pub port: Option<u16>,
    pub env: Vec<EnvVar>,
    pub entrypoint: Vec<String>,
    /// Per-service commands.
    pub commands: HashMap<String, Vec<String>>,
    pub services: Vec<ServiceConfig>,
}

impl VersionConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    fn decode(attrs: &[Attr]) -> Self {
        let mut commands = HashMap::new();
        for cmd in attrs.components("command") {
            let service = cmd.str("service").unwrap_or_default().to_string();
            let args: Vec<String> = cmd
                .get_all("arg")
                .filter_map(|v| match v {
                    Value::Str(s) => Some(s.clone()),
                    _ => None,
                })
                .collect();
            commands.insert(service, args);
        }
        Self {
            port: attrs.int("port").and_then(|p| u16::try_from(p).ok()),
            env: attrs.components("env").into_iter().map(EnvVar::decode).collect(),
            entrypoint: attrs
                .get_all("entrypoint")
                .filter_map(|v| match v {
                    Value::Str(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            commands,
            services: attrs
                .components("service")
                .into_iter()
                .map(ServiceConfig::decode)
                .collect(),
        }
    }

    fn encode(&self) -> Vec<Attr> {
        let mut attrs = Vec::new();
        if let Some(port) = self.port {
            attrs.push(Attr::int("port", port as i64));
        }
        for env in &self.env {
            attrs.push(Attr::component("env", env.encode()));
        }
        for arg in &self.entrypoint {
            attrs.push(Attr::str("entrypoint", arg.clone()));
        }
        let mut services: Vec<&String> = self.commands.keys().collect();
        services.sort();
        for service in services {
            let mut cmd = vec![Attr::str("service", service.clone())];
            for arg in &self.commands[service] {
                cmd.push(Attr::str("arg", arg.clone()));
            }
            attrs.push(Attr::component("command", cmd));
        }
        for service in &self.services {
            attrs.push(Attr::component("service", service.encode()));
        }
        attrs
    }
}

/// Immutable record of one build.
#[derive(Debug, Clone)]
pub struct AppVersion {
    pub id: EntityId,
    pub revision: u64,
    pub app: EntityId,
    pub version: String,
    pub image_url: String,
    pub config: VersionConfig,
}

impl AppVersion {
    pub fn decode(entity: &Entity) -> Result<Self, DecodeError> {
        let app = entity
            .reference("app")
            .cloned()
            .ok_or_else(|| missing(&entity.id, "app"))?;
        let version = entity
            .str("version")
            .ok_or_else(|| missing(&entity.id, "version"))?
            .to_string();
        Ok(Self {
            id: entity.id.clone(),
            revision: entity.revision,
            app,
            version,
            image_url: entity.str("imageUrl").unwrap_or_default().to_string(),
            config: entity
                .components("config")
                .first()
                .map(|c| VersionConfig::decode(c))
                .unwrap_or_default(),
        })
    }

    pub fn encode(&self) -> Vec<Attr> {
        vec![
            Attr::reference("app", self.app.clone()),
            Attr::str("version", self.version.clone()),
            Attr::str("imageUrl", self.image_url.clone()),
            Attr::component("config", self.config.encode()),
        ]
    }

    /// The declared service named `name`, if any.
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.config.services.iter().find(|s| s.name == name)
    }
}

// ---------------------------------------------------------------------------
// SandboxSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct MountSpec {
    pub volume: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeSpec {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub dir: Option<String>,
    pub env: Vec<EnvVar>,
    pub ports: Vec<u16>,
    pub mounts: Vec<MountSpec>,
}

impl ContainerSpec {
    fn decode(attrs: &[Attr]) -> Self {
        Self {
            name: attrs.str("name").unwrap_or_default().to_string(),
            image: attrs.str("image").unwrap_or_default().to_string(),
            command: attrs
                .get_all("command")
                .filter_map(|v| match v {
                    Value::Str(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            dir: attrs.str("dir").map(|s| s.to_string()),
            env: attrs.components("env").into_iter().map(EnvVar::decode).collect(),
            ports: attrs
                .get_all("port")
                .filter_map(|v| match v {
                    Value::Int(p) => u16::try_from(*p).ok(),
                    _ => None,
                })
                .collect(),
            mounts: attrs
                .components("mount")
                .into_iter()
                .map(|m| MountSpec {
                    volume: m.str("volume").unwrap_or_default().to_string(),
                    path: m.str("path").unwrap_or_default().to_string(),
                })
                .collect(),
        }
    }

    fn encode(&self) -> Vec<Attr> {
        let mut attrs = vec![
            Attr::str("name", self.name.clone()),
            Attr::str("image", self.image.clone()),
        ];
        for arg in &self.command {
            attrs.push(Attr::str("command", arg.clone()));
        }
        if let Some(dir) = &self.dir {
            attrs.push(Attr::str("dir", dir.clone()));
        }
        for env in &self.env {
            attrs.push(Attr::component("env", env.encode()));
        }
        for port in &self.ports {
            attrs.push(Attr::int("port", *port as i64));
        }
        for mount in &self.mounts {
            attrs.push(Attr::component(
                "mount",
                vec![
                    Attr::str("volume", mount.volume.clone()),
                    Attr::str("path", mount.path.clone()),
                ],
            ));
        }
        attrs
    }

    /// Environment as a set, with the system-injected version-identity
    /// variables removed.
    fn env_set(&self) -> BTreeSet<(&str, &str)> {
        self.env
            .iter()
            .filter(|e| e.name != ENV_APP && e.name != ENV_VERSION)
            .map(|e| (e.name.as_str(), e.value.as_str()))
            .collect()
    }
}

/// The template a sandbox is built from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxSpec {
    pub version: Option<EntityId>,
    pub containers: Vec<ContainerSpec>,
    pub volumes: Vec<VolumeSpec>,
    pub log_entity: Option<EntityId>,
    pub log_attrs: Vec<(String, String)>,
}

impl SandboxSpec {
    pub fn decode(attrs: &[Attr]) -> Self {
        Self {
            version: attrs.reference("version").cloned(),
            containers: attrs
                .components("container")
                .into_iter()
                .map(ContainerSpec::decode)
                .collect(),
            volumes: attrs
                .components("volume")
                .into_iter()
                .map(|v| VolumeSpec {
                    name: v.str("name").unwrap_or_default().to_string(),
                })
                .collect(),
            log_entity: attrs.reference("logEntity").cloned(),
            log_attrs: attrs
                .components("logAttribute")
                .into_iter()
                .map(|l| {
                    (
                        l.str("name").unwrap_or_default().to_string(),
                        l.str("value").unwrap_or_default().to_string(),
                    )
                })
                .collect(),
        }
    }

    pub fn encode(&self) -> Vec<Attr> {
        let mut attrs = Vec::new();
        if let Some(version) = &self.version {
            attrs.push(Attr::reference("version", version.clone()));
        }
        for container in &self.containers {
            attrs.push(Attr::component("container", container.encode()));
        }
        for volume in &self.volumes {
            attrs.push(Attr::component(
                "volume",
                vec![Attr::str("name", volume.name.clone())],
            ));
        }
        if let Some(log_entity) = &self.log_entity {
            attrs.push(Attr::reference("logEntity", log_entity.clone()));
        }
        for (name, value) in &self.log_attrs {
            attrs.push(Attr::component(
                "logAttribute",
                vec![Attr::str("name", name.clone()), Attr::str("value", value.clone())],
            ));
        }
        attrs
    }

    /// Structural equivalence for pool reuse.
    ///
    /// Two specs are equivalent iff they have the same container count and
    /// each container pair matches on name, image, command, directory and
    /// ports, and on environment as a set after removing the system-injected
    /// version-identity variables. The `version` reference itself is ignored.
    pub fn equivalent(&self, other: &SandboxSpec) -> bool {
        if self.containers.len() != other.containers.len() {
            return false;
        }
        self.containers.iter().zip(&other.containers).all(|(a, b)| {
            a.name == b.name
                && a.image == b.image
                && a.command == b.command
                && a.dir == b.dir
                && a.ports == b.ports
                && a.env_set() == b.env_set()
        })
    }
}

// ---------------------------------------------------------------------------
// SandboxPool
// ---------------------------------------------------------------------------

/// Reconciliation target for a (service, spec) pair.
#[derive(Debug, Clone)]
pub struct SandboxPool {
    pub id: EntityId,
    pub revision: u64,
    pub service: String,
    pub spec: SandboxSpec,
    pub desired_instances: i64,
    pub current_instances: i64,
    pub ready_instances: i64,
    pub referenced_by_versions: Vec<EntityId>,
    pub labels: Vec<(String, String)>,
}

impl SandboxPool {
    pub fn decode(entity: &Entity) -> Result<Self, DecodeError> {
        let service = entity
            .str("service")
            .ok_or_else(|| missing(&entity.id, "service"))?
            .to_string();
        Ok(Self {
            id: entity.id.clone(),
            revision: entity.revision,
            service,
            spec: entity
                .components("sandboxSpec")
                .first()
                .map(|s| SandboxSpec::decode(s))
                .unwrap_or_default(),
            desired_instances: entity.int("desiredInstances").unwrap_or(0),
            current_instances: entity.int("currentInstances").unwrap_or(0),
            ready_instances: entity.int("readyInstances").unwrap_or(0),
            referenced_by_versions: entity.references("referencedByVersions"),
            labels: collect_labels(&entity.attrs),
        })
    }

    /// Encode with the store's usual omission of zero-valued scalars and
    /// empty sets.
    pub fn encode(&self) -> Vec<Attr> {
        let mut attrs = vec![
            Attr::str("service", self.service.clone()),
            Attr::component("sandboxSpec", self.spec.encode()),
        ];
        if self.desired_instances != 0 {
            attrs.push(Attr::int("desiredInstances", self.desired_instances));
        }
        if self.current_instances != 0 {
            attrs.push(Attr::int("currentInstances", self.current_instances));
        }
        if self.ready_instances != 0 {
            attrs.push(Attr::int("readyInstances", self.ready_instances));
        }
        for version in &self.referenced_by_versions {
            attrs.push(Attr::reference("referencedByVersions", version.clone()));
        }
        for (key, value) in &self.labels {
            attrs.push(Attr::label(key, value.clone()));
        }
        attrs
    }

    /// Encode with the zero-valued counters spelled out.
    ///
    /// Replace writes that must scale a pool down or drop its last version
    /// reference have to carry the zeros explicitly, otherwise the encoded
    /// form is indistinguishable from "attribute not written".
    pub fn encode_with_zeros(&self) -> Vec<Attr> {
        let mut attrs = self.encode();
        for (name, value) in [
            ("desiredInstances", self.desired_instances),
            ("currentInstances", self.current_instances),
            ("readyInstances", self.ready_instances),
        ] {
            if value == 0 {
                attrs.push(Attr::int(name, 0));
            }
        }
        attrs
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn references_version(&self, version: &EntityId) -> bool {
        self.referenced_by_versions.iter().any(|v| v == version)
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Pending,
    NotReady,
    Running,
    Stopped,
    Dead,
}

impl SandboxStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "notReady" => Some(Self::NotReady),
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::NotReady => "notReady",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Dead => "dead",
        }
    }

    /// Stopped and dead sandboxes never come back.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Dead)
    }

    /// Pending and notReady sandboxes are worth waiting on.
    pub fn is_starting(&self) -> bool {
        matches!(self, Self::Pending | Self::NotReady)
    }
}

/// A single running (or terminating) instance.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: EntityId,
    pub revision: u64,
    pub spec: SandboxSpec,
    pub status: SandboxStatus,
    /// Assigned addresses, possibly in CIDR form.
    pub network: Vec<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub labels: Vec<(String, String)>,
}

impl Sandbox {
    pub fn decode(entity: &Entity) -> Result<Self, DecodeError> {
        let status = entity
            .str("status")
            .and_then(SandboxStatus::parse)
            .ok_or_else(|| missing(&entity.id, "status"))?;
        Ok(Self {
            id: entity.id.clone(),
            revision: entity.revision,
            spec: entity
                .components("spec")
                .first()
                .map(|s| SandboxSpec::decode(s))
                .unwrap_or_default(),
            status,
            network: entity
                .get_all("network")
                .filter_map(|v| match v {
                    Value::Str(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            last_activity: entity.time("lastActivity"),
            labels: collect_labels(&entity.attrs),
        })
    }

    pub fn encode(&self) -> Vec<Attr> {
        let mut attrs = vec![
            Attr::component("spec", self.spec.encode()),
            Attr::str("status", self.status.as_str()),
        ];
        for addr in &self.network {
            attrs.push(Attr::str("network", addr.clone()));
        }
        if let Some(t) = self.last_activity {
            attrs.push(Attr::time("lastActivity", t));
        }
        for (key, value) in &self.labels {
            attrs.push(Attr::label(key, value.clone()));
        }
        attrs
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Service this sandbox serves.
    pub fn service(&self) -> &str {
        self.label(label::SERVICE).unwrap_or(DEFAULT_SERVICE)
    }

    /// The owning pool, from the pool label.
    pub fn pool(&self) -> Option<EntityId> {
        self.label(label::POOL).map(EntityId::from)
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Name of the out-of-band attribute that binds a sandbox to a node. Absence
/// means "unscheduled".
pub const SCHEDULE_ATTR: &str = "schedule";

/// Schedule key `(kind, node)` carried on a scheduled sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub kind: String,
    pub node: EntityId,
}

impl Schedule {
    pub fn for_node(node: EntityId) -> Self {
        Self {
            kind: kind::NODE.to_string(),
            node,
        }
    }

    pub fn decode(entity: &Entity) -> Option<Self> {
        let attrs = entity.components(SCHEDULE_ATTR);
        let attrs = attrs.first()?;
        Some(Self {
            kind: attrs.str("kind")?.to_string(),
            node: attrs.reference("node")?.clone(),
        })
    }

    pub fn encode(&self) -> Attr {
        Attr::component(
            SCHEDULE_ATTR,
            vec![
                Attr::str("kind", self.kind.clone()),
                Attr::reference("node", self.node.clone()),
            ],
        )
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeStatus {
    #[default]
    Unknown,
    Ready,
    Disabled,
    Unhealthy,
}

impl NodeStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "ready" => Self::Ready,
            "disabled" => Self::Disabled,
            "unhealthy" => Self::Unhealthy,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Ready => "ready",
            Self::Disabled => "disabled",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// A worker in the fleet.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: EntityId,
    pub revision: u64,
    pub api_address: String,
    pub constraints: Vec<(String, String)>,
    pub status: NodeStatus,
}

impl Node {
    pub fn decode(entity: &Entity) -> Result<Self, DecodeError> {
        Ok(Self {
            id: entity.id.clone(),
            revision: entity.revision,
            api_address: entity.str("apiAddress").unwrap_or_default().to_string(),
            constraints: entity
                .components("constraint")
                .into_iter()
                .map(|c| {
                    (
                        c.str("key").unwrap_or_default().to_string(),
                        c.str("value").unwrap_or_default().to_string(),
                    )
                })
                .collect(),
            status: entity
                .str("status")
                .map(NodeStatus::parse)
                .unwrap_or_default(),
        })
    }

    pub fn encode(&self) -> Vec<Attr> {
        let mut attrs = vec![
            Attr::str("apiAddress", self.api_address.clone()),
            Attr::str("status", self.status.as_str()),
        ];
        for (key, value) in &self.constraints {
            attrs.push(Attr::component(
                "constraint",
                vec![Attr::str("key", key.clone()), Attr::str("value", value.clone())],
            ));
        }
        attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(image: &str, env: Vec<EnvVar>) -> ContainerSpec {
        ContainerSpec {
            name: "app".to_string(),
            image: image.to_string(),
            command: vec!["serve".to_string()],
            dir: None,
            env,
            ports: vec![3000],
            mounts: vec![],
        }
    }

    #[test]
    fn test_spec_equivalence_ignores_version_identity() {
        let a = SandboxSpec {
            version: Some(EntityId::new(kind::APP_VERSION, "v1")),
            containers: vec![container(
                "registry.example/blog",
                vec![
                    EnvVar::new(ENV_APP, "blog"),
                    EnvVar::new(ENV_VERSION, "v1"),
                    EnvVar::new("LOG_LEVEL", "info"),
                ],
            )],
            ..Default::default()
        };
        let b = SandboxSpec {
            version: Some(EntityId::new(kind::APP_VERSION, "v2")),
            containers: vec![container(
                "registry.example/blog",
                vec![
                    EnvVar::new("LOG_LEVEL", "info"),
                    EnvVar::new(ENV_VERSION, "v2"),
                    EnvVar::new(ENV_APP, "blog"),
                ],
            )],
            ..Default::default()
        };
        assert!(a.equivalent(&b));
        assert!(b.equivalent(&a));
    }

    #[test]
    fn test_spec_equivalence_rejects_real_differences() {
        let base = SandboxSpec {
            containers: vec![container("postgres", vec![])],
            ..Default::default()
        };

        let mut image_changed = base.clone();
        image_changed.containers[0].image = "postgres:17".to_string();
        assert!(!base.equivalent(&image_changed));

        let mut env_changed = base.clone();
        env_changed.containers[0].env.push(EnvVar::new("PGDATA", "/data"));
        assert!(!base.equivalent(&env_changed));

        let mut port_changed = base.clone();
        port_changed.containers[0].ports = vec![5432];
        assert!(!base.equivalent(&port_changed));

        let mut extra_container = base.clone();
        extra_container.containers.push(container("sidecar", vec![]));
        assert!(!base.equivalent(&extra_container));
    }

    #[test]
    fn test_spec_roundtrip() {
        let spec = SandboxSpec {
            version: Some(EntityId::new(kind::APP_VERSION, "v1")),
            containers: vec![ContainerSpec {
                name: "app".to_string(),
                image: "postgres".to_string(),
                command: vec!["postgres".to_string(), "-D".to_string()],
                dir: Some("/srv".to_string()),
                env: vec![EnvVar::new("A", "1")],
                ports: vec![5432],
                mounts: vec![MountSpec {
                    volume: "data".to_string(),
                    path: "/var/lib/postgresql".to_string(),
                }],
            }],
            volumes: vec![VolumeSpec {
                name: "data".to_string(),
            }],
            log_entity: None,
            log_attrs: vec![("stage".to_string(), "app-run".to_string())],
        };
        let decoded = SandboxSpec::decode(&spec.encode());
        assert_eq!(decoded, spec);
    }

    #[test]
    fn test_pool_encode_omits_zeros_by_default() {
        let pool = SandboxPool {
            id: EntityId::new(kind::SANDBOX_POOL, "p1"),
            revision: 1,
            service: "web".to_string(),
            spec: SandboxSpec::default(),
            desired_instances: 0,
            current_instances: 0,
            ready_instances: 0,
            referenced_by_versions: vec![],
            labels: vec![],
        };
        let attrs = pool.encode();
        assert_eq!(attrs.int("desiredInstances"), None);
        assert_eq!(attrs.int("readyInstances"), None);
    }

    #[test]
    fn test_pool_zero_roundtrip() {
        // Encoding with explicit zeros then decoding restores all counters
        // and the empty version set.
        let pool = SandboxPool {
            id: EntityId::new(kind::SANDBOX_POOL, "p1"),
            revision: 7,
            service: "web".to_string(),
            spec: SandboxSpec::default(),
            desired_instances: 0,
            current_instances: 0,
            ready_instances: 0,
            referenced_by_versions: vec![],
            labels: vec![("app".to_string(), "app/blog".to_string())],
        };
        let entity = Entity {
            id: pool.id.clone(),
            revision: pool.revision,
            attrs: pool.encode_with_zeros(),
        };
        assert_eq!(entity.int("desiredInstances"), Some(0));
        let decoded = SandboxPool::decode(&entity).unwrap();
        assert_eq!(decoded.desired_instances, 0);
        assert_eq!(decoded.current_instances, 0);
        assert_eq!(decoded.ready_instances, 0);
        assert!(decoded.referenced_by_versions.is_empty());
        assert_eq!(decoded.label("app"), Some("app/blog"));
    }

    #[test]
    fn test_pool_roundtrip_with_values() {
        let v1 = EntityId::new(kind::APP_VERSION, "v1");
        let pool = SandboxPool {
            id: EntityId::new(kind::SANDBOX_POOL, "p1"),
            revision: 3,
            service: "postgres".to_string(),
            spec: SandboxSpec {
                containers: vec![container("postgres", vec![])],
                ..Default::default()
            },
            desired_instances: 2,
            current_instances: 1,
            ready_instances: 1,
            referenced_by_versions: vec![v1.clone()],
            labels: vec![("service".to_string(), "postgres".to_string())],
        };
        let entity = Entity {
            id: pool.id.clone(),
            revision: pool.revision,
            attrs: pool.encode(),
        };
        let decoded = SandboxPool::decode(&entity).unwrap();
        assert_eq!(decoded.service, "postgres");
        assert_eq!(decoded.desired_instances, 2);
        assert!(decoded.references_version(&v1));
        assert!(decoded.spec.equivalent(&pool.spec));
    }

    #[test]
    fn test_sandbox_decode_requires_status() {
        let entity = Entity {
            id: EntityId::new(kind::SANDBOX, "s1"),
            revision: 1,
            attrs: vec![Attr::str("status", "warming")],
        };
        assert!(Sandbox::decode(&entity).is_err());

        let entity = Entity {
            id: EntityId::new(kind::SANDBOX, "s1"),
            revision: 1,
            attrs: vec![Attr::str("status", "running"), Attr::label("service", "web")],
        };
        let sandbox = Sandbox::decode(&entity).unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert_eq!(sandbox.service(), "web");
    }

    #[test]
    fn test_sandbox_service_defaults_to_web() {
        let entity = Entity {
            id: EntityId::new(kind::SANDBOX, "s1"),
            revision: 1,
            attrs: vec![Attr::str("status", "running")],
        };
        assert_eq!(Sandbox::decode(&entity).unwrap().service(), DEFAULT_SERVICE);
    }

    #[test]
    fn test_status_classification() {
        assert!(SandboxStatus::Pending.is_starting());
        assert!(SandboxStatus::NotReady.is_starting());
        assert!(!SandboxStatus::Running.is_starting());
        assert!(SandboxStatus::Stopped.is_terminal());
        assert!(SandboxStatus::Dead.is_terminal());
        assert!(!SandboxStatus::Running.is_terminal());
    }

    #[test]
    fn test_schedule_roundtrip() {
        let schedule = Schedule::for_node(EntityId::new(kind::NODE, "n1"));
        let entity = Entity {
            id: EntityId::new(kind::SANDBOX, "s1"),
            revision: 1,
            attrs: vec![Attr::str("status", "pending"), schedule.encode()],
        };
        assert_eq!(Schedule::decode(&entity), Some(schedule));

        let unscheduled = Entity {
            id: EntityId::new(kind::SANDBOX, "s2"),
            revision: 1,
            attrs: vec![Attr::str("status", "pending")],
        };
        assert_eq!(Schedule::decode(&unscheduled), None);
    }

    #[test]
    fn test_version_config_roundtrip() {
        let config = VersionConfig {
            port: Some(8080),
            env: vec![EnvVar::new("LOG_LEVEL", "debug")],
            entrypoint: vec!["/bin/sh".to_string(), "-c".to_string()],
            commands: HashMap::from([("web".to_string(), vec!["serve".to_string()])]),
            services: vec![ServiceConfig {
                name: "web".to_string(),
                image: None,
                disks: vec![],
                concurrency: ServiceConcurrency::auto(20, Duration::from_secs(120)),
            }],
        };
        let decoded = VersionConfig::decode(&config.encode());
        assert_eq!(decoded, config);
        assert_eq!(decoded.port(), 8080);
        assert_eq!(VersionConfig::default().port(), DEFAULT_PORT);
    }

    #[test]
    fn test_node_roundtrip() {
        let node = Node {
            id: EntityId::new(kind::NODE, "n1"),
            revision: 1,
            api_address: "10.1.2.3:7100".to_string(),
            constraints: vec![("zone".to_string(), "a".to_string())],
            status: NodeStatus::Ready,
        };
        let entity = Entity {
            id: node.id.clone(),
            revision: 1,
            attrs: node.encode(),
        };
        let decoded = Node::decode(&entity).unwrap();
        assert_eq!(decoded.api_address, node.api_address);
        assert_eq!(decoded.status, NodeStatus::Ready);
        assert_eq!(decoded.constraints, node.constraints);
    }
}
