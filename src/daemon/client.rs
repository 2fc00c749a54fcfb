//! Daemon client for CLI to connect to the daemon.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::protocol::{
    DaemonRequest, DaemonResponse, ExecFrame, ExecTargetRef, LeaseHandle, PoolStatusEntry,
};
use super::server::DaemonServer;

/// Client for connecting to the daemon.
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    /// Create a new client with the default socket path.
    pub fn new() -> Self {
        Self {
            socket_path: DaemonServer::default_socket_path(),
        }
    }

    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Check if a daemon is reachable.
    pub fn is_available(&self) -> bool {
        self.socket_path.exists() && DaemonServer::is_running(&self.socket_path)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a request and read one response.
    async fn send_request(&self, request: &DaemonRequest) -> Result<DaemonResponse> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("connecting to daemon at {}", self.socket_path.display()))?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let json = serde_json::to_string(request)? + "\n";
        writer.write_all(json.as_bytes()).await?;

        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line.is_empty() {
            bail!("daemon closed the connection");
        }
        Ok(serde_json::from_str(&line)?)
    }

    pub async fn acquire_lease(
        &self,
        app_version: &str,
        service: &str,
        timeout_ms: Option<u64>,
    ) -> Result<LeaseHandle> {
        let request = DaemonRequest::AcquireLease {
            app_version: app_version.to_string(),
            service: service.to_string(),
            timeout_ms,
        };
        match self.send_request(&request).await? {
            DaemonResponse::Leased { lease, .. } => Ok(lease),
            DaemonResponse::Error { kind, message } => bail!("{message} ({kind:?})"),
            other => bail!("unexpected response: {other:?}"),
        }
    }

    pub async fn release_lease(&self, lease: LeaseHandle) -> Result<()> {
        match self.send_request(&DaemonRequest::ReleaseLease { lease }).await? {
            DaemonResponse::Released => Ok(()),
            DaemonResponse::Error { kind, message } => bail!("{message} ({kind:?})"),
            other => bail!("unexpected response: {other:?}"),
        }
    }

    pub async fn renew_lease(&self, lease: LeaseHandle) -> Result<LeaseHandle> {
        match self.send_request(&DaemonRequest::RenewLease { lease }).await? {
            DaemonResponse::Renewed { lease } => Ok(lease),
            DaemonResponse::Error { kind, message } => bail!("{message} ({kind:?})"),
            other => bail!("unexpected response: {other:?}"),
        }
    }

    pub async fn status(&self) -> Result<Vec<PoolStatusEntry>> {
        match self.send_request(&DaemonRequest::Status).await? {
            DaemonResponse::Status { pools } => Ok(pools),
            DaemonResponse::Error { kind, message } => bail!("{message} ({kind:?})"),
            other => bail!("unexpected response: {other:?}"),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        match self.send_request(&DaemonRequest::Shutdown).await? {
            DaemonResponse::ShuttingDown => Ok(()),
            other => bail!("unexpected response: {other:?}"),
        }
    }

    /// Run an exec session, wiring the process's stdin and stdout to the
    /// sandbox. Returns the remote exit code.
    pub async fn exec(&self, target: ExecTargetRef, command: Vec<String>) -> Result<i32> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("connecting to daemon at {}", self.socket_path.display()))?;
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let request = DaemonRequest::Exec { target, command };
        writer
            .write_all((serde_json::to_string(&request)? + "\n").as_bytes())
            .await?;

        match lines.next_line().await? {
            Some(line) => match serde_json::from_str::<DaemonResponse>(&line)? {
                DaemonResponse::ExecStarted => {}
                DaemonResponse::Error { kind, message } => bail!("{message} ({kind:?})"),
                other => bail!("unexpected response: {other:?}"),
            },
            None => bail!("daemon closed the connection"),
        }

        // Pump our stdin into the session until EOF.
        let stdin_pump = tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = [0u8; 4096];
            loop {
                let frame = match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => ExecFrame::StdinClose,
                    Ok(n) => ExecFrame::Stdin {
                        data: BASE64.encode(&buf[..n]),
                    },
                };
                let done = matches!(frame, ExecFrame::StdinClose);
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json + "\n",
                    Err(_) => break,
                };
                if writer.write_all(json.as_bytes()).await.is_err() || done {
                    break;
                }
            }
        });

        let mut stdout = tokio::io::stdout();
        while let Some(line) = lines.next_line().await? {
            match serde_json::from_str::<ExecFrame>(&line)? {
                ExecFrame::Stdout { data } => {
                    stdout.write_all(&BASE64.decode(data.as_bytes())?).await?;
                    stdout.flush().await?;
                }
                ExecFrame::Exit { code } => {
                    stdin_pump.abort();
                    return Ok(code);
                }
                ExecFrame::Aborted { message } => {
                    stdin_pump.abort();
                    bail!("exec aborted: {}", message);
                }
                _ => {}
            }
        }
        stdin_pump.abort();
        bail!("daemon closed the connection during exec")
    }
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}
