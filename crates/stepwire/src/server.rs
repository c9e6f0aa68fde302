//! Plugin side: the RPC server adapter and the process entry point.
//!
//! `serve` runs inside the plugin binary:
//! 1. Validate the handshake environment (reject and exit on mismatch)
//! 2. Bind a listener and print the ready line on stdout
//! 3. Accept the host's connection
//! 4. Dispatch calls until Shutdown, SIGTERM, stdin EOF or disconnect
//!
//! Each call runs in its own task with a fresh background context; the
//! host's cancellation does not cross the boundary.

use std::path::PathBuf;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::value::RawValue;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::TransportError;
use crate::bridge::codec::{JsonCodec, is_encode_error};
use crate::bridge::protocol::{
    HostMessage, PluginMessage, RUN_METHOD, RemoteError, RemoteErrorKind,
};
use crate::bridge::transport::{
    BoxedWriter, Connection, NETWORK_ENV, Network, PluginListener, SOCKET_DIR_ENV, WireProtocol,
};
use crate::capability::{RequestEnvelope, ResponseEnvelope, StepError, StepOutput, StepPlugin};
use crate::context::CallContext;
use crate::handshake::{CORE_PROTOCOL_VERSION, HandshakeConfig, HandshakeError, ReadyLine};

type ReplyWriter = Arc<Mutex<FramedWrite<BoxedWriter, JsonCodec<PluginMessage>>>>;

/// What the server does with an error returned by the step implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Send it to the host as a remote error; the host's call fails with the
    /// same `StepError` kind.
    #[default]
    Propagate,
    /// Fold it into a `{"message": <error>, "success": false}` payload so
    /// the host always receives a structured response.
    Payload,
}

/// RPC server adapter: decodes calls, invokes the step, encodes replies.
pub struct RpcServer<P> {
    plugin: Arc<P>,
    error_policy: ErrorPolicy,
}

impl<P: StepPlugin> RpcServer<P> {
    pub fn new(plugin: Arc<P>) -> Self {
        Self {
            plugin,
            error_policy: ErrorPolicy::default(),
        }
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Handle one call. Never panics on bad input.
    pub async fn dispatch(
        &self,
        method: &str,
        payload: Box<RawValue>,
    ) -> Result<Box<RawValue>, RemoteError> {
        if method != RUN_METHOD {
            return Err(StepError::UnknownMethod(method.to_string()).to_remote());
        }

        let plugin = Arc::clone(&self.plugin);
        let request = RequestEnvelope::from_raw(payload);
        // Run in a separate task so a panicking step fails only this call.
        let outcome = tokio::spawn(async move {
            let ctx = CallContext::background();
            plugin.run(&ctx, request).await
        })
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(join_err) => {
                tracing::error!(error = %join_err, "Step implementation panicked");
                Err(StepError::execution(format!("step panicked: {join_err}")))
            }
        };

        match result {
            Ok(response) => Ok(response.into_raw()),
            Err(e) => self.apply_error_policy(e),
        }
    }

    fn apply_error_policy(&self, err: StepError) -> Result<Box<RawValue>, RemoteError> {
        match self.error_policy {
            ErrorPolicy::Propagate => Err(err.to_remote()),
            ErrorPolicy::Payload => {
                tracing::debug!(error = %err, "Folding step error into failure payload");
                ResponseEnvelope::from_output(&StepOutput::failed(err.to_string()))
                    .map(ResponseEnvelope::into_raw)
                    .map_err(|e| e.to_remote())
            }
        }
    }

    /// Serve one connection until the host disconnects, asks for shutdown,
    /// or `shutdown` is cancelled. Calls still running at that point are
    /// aborted.
    pub async fn serve_connection(
        self: Arc<Self>,
        conn: Connection,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        let (reader, writer) = conn.into_split();
        let mut reader = FramedRead::new(reader, JsonCodec::<HostMessage>::new());
        let writer: ReplyWriter = Arc::new(Mutex::new(FramedWrite::new(
            writer,
            JsonCodec::<PluginMessage>::new(),
        )));
        // Dropped on return, which aborts calls still in flight.
        let mut in_flight = JoinSet::new();

        loop {
            while in_flight.try_join_next().is_some() {}

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown signalled, closing connection");
                    let mut w = writer.lock().await;
                    let _ = w.send(PluginMessage::ShuttingDown).await;
                    return Ok(());
                }

                msg = reader.next() => {
                    match msg {
                        Some(Ok(HostMessage::Call { seq, method, payload })) => {
                            tracing::debug!(seq, %method, "Call received");
                            let server = Arc::clone(&self);
                            let writer = Arc::clone(&writer);
                            in_flight.spawn(async move {
                                let reply = match server.dispatch(&method, payload).await {
                                    Ok(payload) => PluginMessage::success(seq, payload),
                                    Err(error) => {
                                        tracing::debug!(seq, %error, "Call failed");
                                        PluginMessage::failure(seq, error)
                                    }
                                };
                                let mut w = writer.lock().await;
                                match w.send(reply).await {
                                    Ok(()) => {}
                                    Err(e) if is_encode_error(&e) => {
                                        // Nothing was written; the host still waits on `seq`.
                                        tracing::warn!(seq, error = %e, "Reply not sendable, reporting failure");
                                        if let Err(e) = w.send(unsendable_reply(seq, e)).await {
                                            tracing::warn!(seq, error = %e, "Failed to send reply");
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!(seq, error = %e, "Failed to send reply");
                                    }
                                }
                            });
                        }
                        Some(Ok(HostMessage::Ping { seq })) => {
                            tracing::trace!(seq, "Ping");
                            let mut w = writer.lock().await;
                            w.send(PluginMessage::Pong { seq }).await?;
                        }
                        Some(Ok(HostMessage::Shutdown)) => {
                            tracing::info!("Shutdown requested by host");
                            let mut w = writer.lock().await;
                            let _ = w.send(PluginMessage::ShuttingDown).await;
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "Connection error");
                            return Err(TransportError::Io(e));
                        }
                        None => {
                            tracing::info!("Host closed connection");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

fn unsendable_reply(seq: u64, err: std::io::Error) -> PluginMessage {
    let err = TransportError::Encode(err.to_string());
    PluginMessage::failure(
        seq,
        RemoteError::new(RemoteErrorKind::Execution, err.to_string()),
    )
}

/// Plugin process configuration.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub handshake: HandshakeConfig,
    pub error_policy: ErrorPolicy,
    /// Preferred network; overridden by `PLUGIN_NETWORK` from the host.
    pub network: Network,
    /// Overridden by `PLUGIN_UNIX_SOCKET_DIR` from the host.
    pub socket_dir: Option<PathBuf>,
    /// Exit when stdin reaches EOF (the host went away).
    pub exit_on_stdin_eof: bool,
}

impl ServeConfig {
    pub fn new(handshake: HandshakeConfig) -> Self {
        Self {
            handshake,
            error_policy: ErrorPolicy::default(),
            network: Network::platform_default(),
            socket_dir: None,
            exit_on_stdin_eof: true,
        }
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = Some(dir.into());
        self
    }

    pub fn with_exit_on_stdin_eof(mut self, enabled: bool) -> Self {
        self.exit_on_stdin_eof = enabled;
        self
    }

    /// Apply the host's transport hints.
    fn apply_host_env<F>(&mut self, lookup: F) -> Result<(), HandshakeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(network) = lookup(NETWORK_ENV) {
            self.network = Network::parse(&network)
                .ok_or_else(|| HandshakeError::UnsupportedNetwork(network.clone()))?;
        }
        if let Some(dir) = lookup(SOCKET_DIR_ENV)
            && !dir.is_empty()
        {
            self.socket_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("plugin handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("failed to set up plugin listener: {0}")]
    Listen(std::io::Error),
    #[error("failed to write handshake line: {0}")]
    Stdout(std::io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Run the plugin side of the protocol. Returns when the host is done.
pub async fn serve<P: StepPlugin>(config: ServeConfig, plugin: Arc<P>) -> Result<(), ServeError> {
    let lookup = |key: &str| std::env::var(key).ok();
    let mut config = config;

    let negotiated = config.handshake.validate_host_env(lookup);
    let version = match negotiated.and_then(|v| config.apply_host_env(lookup).map(|()| v)) {
        Ok(v) => v,
        Err(e) => {
            if let Some(line) = e.reject_line() {
                let _ = write_stdout_line(&line).await;
            }
            if matches!(e, HandshakeError::MissingCookie { .. }) {
                eprintln!(
                    "This binary is a plugin. It is not meant to be executed directly; \
                     it is launched by a host process."
                );
            }
            return Err(ServeError::Handshake(e));
        }
    };
    tracing::debug!(version, network = %config.network, "Handshake accepted");

    let listener = PluginListener::bind(config.network, config.socket_dir.as_deref())
        .await
        .map_err(ServeError::Listen)?;

    let ready = ReadyLine {
        core_version: CORE_PROTOCOL_VERSION,
        app_version: version,
        endpoint: listener.endpoint().clone(),
        protocol: WireProtocol::Json,
    };
    write_stdout_line(&ready.to_string())
        .await
        .map_err(ServeError::Stdout)?;
    tracing::info!(endpoint = %listener.endpoint(), "Plugin ready");

    let shutdown = CancellationToken::new();
    spawn_shutdown_watchers(&shutdown, config.exit_on_stdin_eof);

    let conn = tokio::select! {
        conn = listener.accept() => conn.map_err(|e| ServeError::Transport(TransportError::Io(e)))?,
        _ = shutdown.cancelled() => {
            tracing::info!("Shutdown before host connected");
            return Ok(());
        }
    };
    tracing::debug!("Host connected");

    let server = Arc::new(RpcServer::new(plugin).with_error_policy(config.error_policy));
    server.serve_connection(conn, shutdown.clone()).await?;

    shutdown.cancel();
    tracing::info!("Plugin exiting");
    Ok(())
}

async fn write_stdout_line(line: &str) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

fn spawn_shutdown_watchers(shutdown: &CancellationToken, watch_stdin: bool) {
    #[cfg(unix)]
    {
        let token = shutdown.clone();
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, shutting down...");
                            token.cancel();
                        }
                        _ = token.cancelled() => {}
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if watch_stdin {
        // A plain thread: tokio's stdin read cannot be cancelled and would
        // hold up runtime shutdown.
        let token = shutdown.clone();
        let spawned = std::thread::Builder::new()
            .name("stdin-watch".to_string())
            .spawn(move || {
                use std::io::Read;
                let mut stdin = std::io::stdin();
                let mut buf = [0u8; 64];
                loop {
                    match stdin.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                if !token.is_cancelled() {
                    tracing::info!("Stdin closed (host died?), shutting down");
                    token.cancel();
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "Failed to start stdin watcher");
        }
    }
}
