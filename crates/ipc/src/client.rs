//! IPC client
//!
//! Connects to a node's Unix socket and sends JSON-RPC 2.0 requests.
//! Event lines the server interleaves with responses are skipped.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::protocol::{RpcRequest, RpcResponse};

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Node not running")]
    NodeNotRunning,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Node error: code={code}, message={message}")]
    NodeError { code: i32, message: String },
}

pub type Result<T> = std::result::Result<T, IpcError>;

pub struct IpcClient {
    socket_path: String,
    next_id: AtomicU64,
}

impl IpcClient {
    pub fn new(socket_path: &str) -> Self {
        Self {
            socket_path: socket_path.to_string(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Send a JSON-RPC request and return the result.
    #[cfg(unix)]
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        use tokio::net::UnixStream;

        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|_| IpcError::NodeNotRunning)?;
        let (reader, mut writer) = stream.into_split();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(method, params, id);
        let json = serde_json::to_string(&request)
            .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
        debug!("IPC request: {}", json);

        writer
            .write_all(format!("{}\n", json).as_bytes())
            .await
            .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;

        let mut reader = BufReader::new(reader);
        loop {
            let mut line = String::new();
            let read = reader
                .read_line(&mut line)
                .await
                .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
            if read == 0 {
                return Err(IpcError::InvalidResponse("connection closed".into()));
            }
            debug!("IPC line: {}", line.trim());

            let value: Value = serde_json::from_str(line.trim())
                .map_err(|e| IpcError::InvalidResponse(e.to_string()))?;
            if value.get("jsonrpc").is_none() {
                continue;
            }
            let response: RpcResponse = serde_json::from_value(value)
                .map_err(|e| IpcError::InvalidResponse(e.to_string()))?;
            if response.id != Some(id) && response.id.is_some() {
                continue;
            }

            if let Some(err) = response.error {
                return Err(IpcError::NodeError {
                    code: err.code,
                    message: err.message,
                });
            }
            return response
                .result
                .ok_or_else(|| IpcError::InvalidResponse("No result in response".to_string()));
        }
    }

    /// Check if the node is running by attempting a connection.
    #[cfg(unix)]
    pub async fn is_running(&self) -> bool {
        tokio::net::UnixStream::connect(&self.socket_path)
            .await
            .is_ok()
    }
}
