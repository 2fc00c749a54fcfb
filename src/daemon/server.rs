//! Daemon server - Unix socket server for the orchestrator RPC surface.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::protocol::{DaemonRequest, DaemonResponse, ErrorKind, ExecFrame, ExecTargetRef};
use crate::activator::{Activator, Lease};
use crate::entity::EntityId;
use crate::exec::{ExecInput, ExecRunner};

/// Daemon server state.
pub struct DaemonServer {
    activator: Arc<Activator>,
    exec: Arc<ExecRunner>,
    socket_path: PathBuf,
}

impl DaemonServer {
    pub fn new(activator: Arc<Activator>, exec: Arc<ExecRunner>) -> Self {
        Self {
            activator,
            exec,
            socket_path: Self::default_socket_path(),
        }
    }

    pub fn with_socket_path(mut self, socket_path: PathBuf) -> Self {
        self.socket_path = socket_path;
        self
    }

    /// Get the default socket path.
    pub fn default_socket_path() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            let dir = PathBuf::from(home).join(".fleetd");
            let _ = std::fs::create_dir_all(&dir);
            dir.join("daemon.sock")
        } else {
            PathBuf::from("/tmp/fleetd-daemon.sock")
        }
    }

    /// Check if a daemon is already running.
    pub fn is_running(socket_path: &Path) -> bool {
        std::os::unix::net::UnixStream::connect(socket_path).is_ok()
    }

    /// Run the daemon server until a `Shutdown` request arrives.
    pub async fn run(&self) -> Result<()> {
        if Self::is_running(&self.socket_path) {
            bail!(
                "daemon is already running at {}",
                self.socket_path.display()
            );
        }

        // Remove stale socket
        let _ = std::fs::remove_file(&self.socket_path);
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(socket = %self.socket_path.display(), "daemon listening");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let activator = Arc::clone(&self.activator);
                        let exec = Arc::clone(&self.exec);
                        let shutdown = shutdown_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, activator, exec, shutdown).await {
                                warn!(error = %e, "client error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept error");
                    }
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        info!("daemon stopped");
        Ok(())
    }
}

async fn write_json<T: Serialize>(writer: &mut OwnedWriteHalf, value: &T) -> Result<()> {
    let json = serde_json::to_string(value)? + "\n";
    writer.write_all(json.as_bytes()).await?;
    Ok(())
}

/// Handle a single client connection.
async fn handle_client(
    stream: UnixStream,
    activator: Arc<Activator>,
    exec: Arc<ExecRunner>,
    shutdown: mpsc::Sender<()>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                let response =
                    DaemonResponse::error(ErrorKind::Internal, format!("invalid request: {}", e));
                write_json(&mut writer, &response).await?;
                continue;
            }
        };

        match request {
            DaemonRequest::Exec { target, command } => {
                write_json(&mut writer, &DaemonResponse::ExecStarted).await?;
                exec_session(&mut lines, &mut writer, Arc::clone(&exec), target, command).await?;
            }
            request => {
                let response = handle_request(request, &activator).await;
                write_json(&mut writer, &response).await?;
                if matches!(response, DaemonResponse::ShuttingDown) {
                    let _ = shutdown.send(()).await;
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Handle a single non-exec request.
async fn handle_request(request: DaemonRequest, activator: &Activator) -> DaemonResponse {
    match request {
        DaemonRequest::AcquireLease {
            app_version,
            service,
            timeout_ms,
        } => {
            let version = EntityId::from(app_version.as_str());
            let result = match timeout_ms {
                Some(ms) => {
                    activator
                        .acquire_lease_with_timeout(&version, &service, Duration::from_millis(ms))
                        .await
                }
                None => activator.acquire_lease(&version, &service).await,
            };
            match result {
                Ok(lease) => DaemonResponse::Leased {
                    sandbox: lease.sandbox.to_string(),
                    url: lease.url.clone(),
                    lease_size: lease.size,
                    lease: (&lease).into(),
                },
                Err(e) => DaemonResponse::lease_error(&e),
            }
        }
        DaemonRequest::ReleaseLease { lease } => {
            activator.release_lease(&Lease::from(&lease));
            DaemonResponse::Released
        }
        DaemonRequest::RenewLease { lease } => {
            activator.renew_lease(&Lease::from(&lease));
            DaemonResponse::Renewed { lease }
        }
        DaemonRequest::Status => DaemonResponse::Status {
            pools: activator.status().iter().map(Into::into).collect(),
        },
        DaemonRequest::Shutdown => DaemonResponse::ShuttingDown,
        DaemonRequest::Exec { .. } => {
            // Handled before dispatch; a stray one here is a protocol bug.
            DaemonResponse::error(ErrorKind::Internal, "exec must open a session")
        }
    }
}

/// Pump an exec session: client frames in, node output and the exit frame
/// out. The connection returns to request mode afterwards.
async fn exec_session(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
    exec: Arc<ExecRunner>,
    target: ExecTargetRef,
    command: Vec<String>,
) -> Result<()> {
    let (in_tx, in_rx) = mpsc::channel::<ExecInput>(16);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(16);

    let mut session = tokio::spawn(async move {
        match target {
            ExecTargetRef::Sandbox(id) => {
                exec.exec_in_sandbox(&EntityId::from(id.as_str()), &command, in_rx, out_tx)
                    .await
            }
            ExecTargetRef::App(id) => {
                exec.exec_in_app(&EntityId::from(id.as_str()), &command, in_rx, out_tx)
                    .await
            }
        }
    });

    let mut in_tx = Some(in_tx);
    let mut client_open = true;
    loop {
        tokio::select! {
            result = &mut session => {
                while let Ok(bytes) = out_rx.try_recv() {
                    write_json(writer, &ExecFrame::Stdout { data: BASE64.encode(&bytes) }).await?;
                }
                let frame = match result {
                    Ok(Ok(code)) => ExecFrame::Exit { code },
                    Ok(Err(e)) => ExecFrame::Aborted { message: e.to_string() },
                    Err(e) => ExecFrame::Aborted { message: e.to_string() },
                };
                write_json(writer, &frame).await?;
                return Ok(());
            }
            Some(bytes) = out_rx.recv() => {
                write_json(writer, &ExecFrame::Stdout { data: BASE64.encode(&bytes) }).await?;
            }
            line = lines.next_line(), if client_open => {
                match line? {
                    None => {
                        client_open = false;
                        in_tx = None;
                    }
                    Some(line) => match serde_json::from_str::<ExecFrame>(&line) {
                        Ok(ExecFrame::Stdin { data }) => {
                            if let Some(tx) = &in_tx {
                                let bytes = BASE64.decode(data.as_bytes())?;
                                let _ = tx.send(ExecInput::Data(bytes)).await;
                            }
                        }
                        Ok(ExecFrame::Resize { cols, rows }) => {
                            if let Some(tx) = &in_tx {
                                let _ = tx.send(ExecInput::Resize { cols, rows }).await;
                            }
                        }
                        Ok(ExecFrame::StdinClose) => {
                            in_tx = None;
                        }
                        Ok(other) => warn!(frame = ?other, "unexpected exec frame from client"),
                        Err(e) => warn!(error = %e, "invalid exec frame"),
                    },
                }
            }
        }
    }
}
