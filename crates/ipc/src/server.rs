//! IPC server
//!
//! Binds a Unix socket, accepts connections and dispatches newline-delimited
//! JSON-RPC requests to an [`IpcHandler`]. Events broadcast through
//! [`IpcServer::send_event`] are written to every connected client.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::protocol::{RpcError, RpcEvent, RpcRequest, RpcResponse, PARSE_ERROR};

/// Trait that services implement to handle IPC requests.
pub trait IpcHandler: Send + Sync + 'static {
    fn handle(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send + '_>>;
}

pub struct IpcServer {
    socket_path: String,
    event_tx: broadcast::Sender<String>,
}

impl IpcServer {
    pub fn new(socket_path: &str) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            socket_path: socket_path.to_string(),
            event_tx,
        }
    }

    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// Get a clone of the event sender for broadcasting events to all clients.
    pub fn event_sender(&self) -> broadcast::Sender<String> {
        self.event_tx.clone()
    }

    /// Broadcast an event to all connected clients.
    pub fn send_event(&self, event: &str, data: Value) {
        if let Ok(msg) = serde_json::to_string(&RpcEvent::new(event, data)) {
            let _ = self.event_tx.send(msg);
        }
    }

    /// Accept connections until `shutdown` flips to `true`.
    #[cfg(unix)]
    pub async fn run(
        &self,
        handler: Arc<dyn IpcHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        use tokio::net::UnixListener;

        // Remove stale socket
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("IPC server listening on {}", self.socket_path);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let handler = handler.clone();
                        let event_rx = self.event_tx.subscribe();
                        tokio::spawn(Self::handle_connection(stream, handler, event_rx));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("IPC server stopped");
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }

    #[cfg(unix)]
    async fn handle_connection(
        stream: tokio::net::UnixStream,
        handler: Arc<dyn IpcHandler>,
        mut event_rx: broadcast::Receiver<String>,
    ) {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        loop {
            let mut line = String::new();

            tokio::select! {
                result = reader.read_line(&mut line) => {
                    match result {
                        Ok(0) => {
                            debug!("IPC client disconnected");
                            break;
                        }
                        Ok(_) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            let response = dispatch(handler.as_ref(), line).await;
                            let json = match serde_json::to_string(&response) {
                                Ok(json) => json,
                                Err(e) => {
                                    error!("Failed to encode response: {}", e);
                                    continue;
                                }
                            };
                            if writer.write_all(format!("{}\n", json).as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("IPC read error: {}", e);
                            break;
                        }
                    }
                }
                event = event_rx.recv() => {
                    match event {
                        Ok(event) => {
                            if writer.write_all(format!("{}\n", event).as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("IPC client lagged, dropped {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }
}

async fn dispatch(handler: &dyn IpcHandler, line: &str) -> RpcResponse {
    match serde_json::from_str::<RpcRequest>(line) {
        Ok(req) => match handler.handle(&req.method, req.params).await {
            Ok(result) => RpcResponse::success(req.id, result),
            Err(e) => RpcResponse::error(Some(req.id), e),
        },
        Err(e) => {
            warn!("Invalid JSON-RPC request: {}", e);
            RpcResponse::error(None, RpcError::new(PARSE_ERROR, format!("Parse error: {}", e)))
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        #[cfg(unix)]
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
