//! JSON protocol for daemon communication.

use serde::{Deserialize, Serialize};

use crate::activator::{Lease, LeaseError, PoolStatus};
use crate::entity::EntityId;

/// A lease as it travels over the wire. Echoed back verbatim on release and
/// renew.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseHandle {
    pub version: String,
    pub sandbox: String,
    pub service: String,
    pub size: u32,
    pub url: String,
}

impl From<&Lease> for LeaseHandle {
    fn from(lease: &Lease) -> Self {
        Self {
            version: lease.version.to_string(),
            sandbox: lease.sandbox.to_string(),
            service: lease.service.clone(),
            size: lease.size,
            url: lease.url.clone(),
        }
    }
}

impl From<&LeaseHandle> for Lease {
    fn from(handle: &LeaseHandle) -> Self {
        Self {
            version: EntityId::from(handle.version.as_str()),
            sandbox: EntityId::from(handle.sandbox.as_str()),
            service: handle.service.clone(),
            size: handle.size,
            url: handle.url.clone(),
        }
    }
}

/// Target of an exec request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ExecTargetRef {
    /// An existing sandbox by id.
    Sandbox(String),
    /// An app: run in a one-off ephemeral sandbox of its active version.
    App(String),
}

/// Request from a caller (router or CLI) to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonRequest {
    /// Acquire a lease on a running sandbox for (version, service).
    AcquireLease {
        app_version: String,
        service: String,
        /// Deadline for the blocking wait; expiry maps to
        /// `deadline_exceeded`.
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Release a lease. Idempotent.
    ReleaseLease { lease: LeaseHandle },
    /// Record activity on a lease. Never blocks.
    RenewLease { lease: LeaseHandle },
    /// Run a command against a sandbox or an app. After `ExecStarted` the
    /// connection carries [`ExecFrame`] lines until `Exit`.
    Exec {
        target: ExecTargetRef,
        command: Vec<String>,
    },
    /// Pool counters.
    Status,
    /// Stop the daemon.
    Shutdown,
}

/// Stable error kinds so callers can branch without string matching.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PoolNotFound,
    PoolMaxed,
    SandboxDiedEarly,
    DeadlineExceeded,
    Internal,
}

impl From<&LeaseError> for ErrorKind {
    fn from(err: &LeaseError) -> Self {
        match err {
            LeaseError::PoolNotFound { .. } => ErrorKind::PoolNotFound,
            LeaseError::PoolMaxed { .. } => ErrorKind::PoolMaxed,
            LeaseError::SandboxDiedEarly { .. } => ErrorKind::SandboxDiedEarly,
            LeaseError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            LeaseError::Decode(_) | LeaseError::Store(_) => ErrorKind::Internal,
        }
    }
}

/// Per-pool counters reported by `Status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatusEntry {
    pub pool: String,
    pub version: String,
    pub service: String,
    pub desired_instances: Option<i64>,
    pub running: usize,
    pub starting: usize,
    pub terminal: usize,
    pub slots_used: u32,
    pub slots_max: u32,
}

impl From<&PoolStatus> for PoolStatusEntry {
    fn from(status: &PoolStatus) -> Self {
        Self {
            pool: status.pool.to_string(),
            version: status.version.to_string(),
            service: status.service.clone(),
            desired_instances: status.desired_instances,
            running: status.running,
            starting: status.starting,
            terminal: status.terminal,
            slots_used: status.slots_used,
            slots_max: status.slots_max,
        }
    }
}

/// Response from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonResponse {
    Leased {
        sandbox: String,
        url: String,
        lease_size: u32,
        lease: LeaseHandle,
    },
    Released,
    Renewed {
        lease: LeaseHandle,
    },
    /// The connection now carries [`ExecFrame`] lines until `Exit`.
    ExecStarted,
    Status {
        pools: Vec<PoolStatusEntry>,
    },
    ShuttingDown,
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl DaemonResponse {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        DaemonResponse::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn lease_error(err: &LeaseError) -> Self {
        Self::error(ErrorKind::from(err), err.to_string())
    }
}

/// One line of an interactive exec session, in either direction. Payloads are
/// base64 so arbitrary bytes survive the line protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "io", rename_all = "snake_case")]
pub enum ExecFrame {
    Stdin { data: String },
    Resize { cols: u16, rows: u16 },
    StdinClose,
    Stdout { data: String },
    Exit { code: i32 },
    Aborted { message: String },
}
