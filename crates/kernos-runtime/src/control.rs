//! Loopback control endpoint of a running host.
//!
//! The CLI talks to the host over a plain TCP socket on `127.0.0.1`.  Each
//! request and each response is a single line of JSON:
//!
//! ```text
//! → {"request":"snapshot"}
//! ← {"response":"snapshot","pid":4242,"uptime_ms":1200,"kernels":[...]}
//! → {"request":"restart_kernel","id":"chat"}
//! ← {"response":"restart","outcome":{"outcome":"restarted","attempt":0,"generation":2}}
//! ```
//!
//! A connection may carry any number of requests.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kernos_kernel::RestartOutcome;
use kernos_types::{KernelSnapshot, KernosError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default TCP port of the control endpoint.
pub const DEFAULT_CONTROL_PORT: u16 = 7878;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum ControlRequest {
    Snapshot,
    RestartKernel { id: String },
    Shutdown { actor: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum ControlResponse {
    Snapshot {
        pid: u32,
        uptime_ms: u64,
        kernels: Vec<KernelSnapshot>,
    },
    Restart {
        outcome: RestartOutcome,
    },
    Ack,
    Error {
        message: String,
    },
}

/// What the server delegates every decoded request to.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(&self, request: ControlRequest) -> ControlResponse;
}

// ---------------------------------------------------------------------------
// ControlServer
// ---------------------------------------------------------------------------

pub struct ControlServer {
    listener: TcpListener,
    handler: Arc<dyn ControlHandler>,
}

impl ControlServer {
    /// Bind to `127.0.0.1:port`.  Port 0 picks an ephemeral port.
    pub async fn bind(port: u16, handler: Arc<dyn ControlHandler>) -> Result<Self, KernosError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| KernosError::Io(format!("control endpoint bind error on {addr}: {e}")))?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, KernosError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires.  Each connection gets its
    /// own task.
    pub async fn serve(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "control endpoint listening");
        }
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let handler = Arc::clone(&self.handler);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            result = handle_connection(stream, handler) => {
                                if let Err(e) = result {
                                    debug!(%peer, error = %e, "control client error");
                                }
                            }
                        }
                    });
                }
                Err(e) => warn!(error = %e, "control accept error"),
            }
        }
        debug!("control endpoint closed");
    }
}

async fn handle_connection(stream: TcpStream, handler: Arc<dyn ControlHandler>) -> Result<(), KernosError> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => handler.handle(request).await,
            Err(e) => ControlResponse::Error {
                message: format!("malformed request: {e}"),
            },
        };
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        write.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ControlClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ControlClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(port: u16) -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            timeout: Duration::from_secs(5),
        }
    }

    /// Bound on connect, send and receive together.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn request(&self, request: &ControlRequest) -> Result<ControlResponse, KernosError> {
        timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| KernosError::Channel(format!("no answer from {} within {:?}", self.addr, self.timeout)))?
    }

    async fn exchange(&self, request: &ControlRequest) -> Result<ControlResponse, KernosError> {
        let stream = TcpStream::connect(self.addr).await?;
        let (read, mut write) = stream.into_split();

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        write.write_all(line.as_bytes()).await?;

        let mut lines = BufReader::new(read).lines();
        match lines.next_line().await? {
            Some(reply) => Ok(serde_json::from_str(&reply)?),
            None => Err(KernosError::Channel("control endpoint closed the connection".into())),
        }
    }

    /// `true` when something answers a snapshot request.
    pub async fn is_reachable(&self) -> bool {
        matches!(
            self.request(&ControlRequest::Snapshot).await,
            Ok(ControlResponse::Snapshot { .. })
        )
    }
}
