//! Daemon mode: the orchestrator's RPC surface.
//!
//! The router and the CLI connect over a Unix socket speaking
//! newline-delimited JSON to acquire, renew and release leases, run exec
//! sessions, and read pool status.

mod client;
mod protocol;
mod server;

pub use client::DaemonClient;
pub use protocol::{
    DaemonRequest, DaemonResponse, ErrorKind, ExecFrame, ExecTargetRef, LeaseHandle,
    PoolStatusEntry,
};
pub use server::DaemonServer;
