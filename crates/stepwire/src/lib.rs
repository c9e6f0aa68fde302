//! stepwire: run step implementations in separate plugin processes.
//!
//! Host side: `PluginLauncher` spawns a plugin binary, verifies the
//! handshake and hands out a `PluginHandle` whose `RpcClient` implements
//! `StepPlugin`. Plugin side: `serve` exposes any `StepPlugin` over the same
//! protocol. The same trait is implemented in-process by the step itself, so
//! callers choose local or remote execution at composition time.

pub mod bridge;
pub mod capability;
pub mod client;
pub mod context;
pub mod handshake;
pub mod launcher;
pub mod logging;
pub mod pool;
pub mod server;

#[cfg(all(test, unix))]
mod test_support;

pub use bridge::TransportError;
pub use bridge::transport::{Endpoint, Network, WireProtocol};
pub use capability::{
    RequestEnvelope, ResponseEnvelope, StepError, StepInput, StepOutput, StepPlugin,
};
pub use client::RpcClient;
pub use context::{CallContext, Cancellation, CancellationToken};
pub use handshake::{HandshakeConfig, HandshakeError, ReadyLine};
pub use launcher::{LaunchError, LauncherConfig, PluginHandle, PluginLauncher};
pub use logging::init_tracing;
pub use pool::{PluginPool, PoolError, PooledPlugin};
pub use server::{ErrorPolicy, RpcServer, ServeConfig, ServeError, serve};
