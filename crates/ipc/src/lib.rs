//! Encore IPC
//!
//! JSON-RPC 2.0 control socket over Unix sockets. The payout node exposes its
//! ledger through it and streams ledger events to connected operators.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{IpcClient, IpcError};
pub use protocol::{RpcError, RpcEvent, RpcRequest, RpcResponse};
pub use server::{IpcHandler, IpcServer};

use std::path::PathBuf;

/// Get the default socket path for a service.
///
/// - Linux: `$XDG_RUNTIME_DIR/{service}.sock` or `/tmp/{service}.sock`
/// - other Unix: `/tmp/{service}.sock`
pub fn default_socket_path(service: &str) -> String {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_RUNTIME_DIR")
            .map(|dir| format!("{}/{}.sock", dir, service))
            .unwrap_or_else(|_| format!("/tmp/{}.sock", service))
    }
    #[cfg(not(target_os = "linux"))]
    {
        format!("/tmp/{}.sock", service)
    }
}

/// Get the socket path as a PathBuf.
pub fn default_socket_path_buf(service: &str) -> PathBuf {
    PathBuf::from(default_socket_path(service))
}
