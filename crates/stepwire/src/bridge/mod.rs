//! IPC bridge for host-plugin communication.
//!
//! This module provides the wire protocol, codec and connection transport
//! shared by the RPC client (host) and server (plugin).
//!
//! # Architecture
//!
//! - **protocol**: Message types (HostMessage, PluginMessage, RemoteError)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **transport**: Listener/connection over unix or loopback tcp sockets

pub mod codec;
pub mod protocol;
pub mod transport;

/// Failures of the channel itself, as opposed to the remote step.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to plugin closed")]
    ConnectionClosed,

    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}
