//! Process lifecycle manager: spawn a plugin, complete the handshake, hand
//! out a live `PluginHandle`, and tear the process down again.
//!
//! Startup:
//! 1. Spawn the binary with the handshake environment and piped stdio
//! 2. Forward its stderr into our tracing output
//! 3. Read one line from its stdout (bounded by `start_timeout`)
//! 4. Validate the line, connect to the announced endpoint
//!
//! Any failure kills and reaps the child before returning. Nothing is
//! retried here; retry policy belongs to the caller.
//!
//! Teardown (`PluginHandle::release`): Shutdown frame, grace period,
//! SIGTERM, grace period, SIGKILL, reap.

use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};

use crate::bridge::transport::{
    Connection, Endpoint, NETWORK_ENV, Network, SOCKET_DIR_ENV, WireProtocol,
};
use crate::client::RpcClient;
use crate::handshake::{HandshakeConfig, HandshakeError};

/// Tracing target for lines the plugin writes to stderr.
pub const PLUGIN_LOG_TARGET: &str = "stepwire::plugin";

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra environment for the child, on top of the inherited one.
    pub env: Vec<(String, String)>,
    pub handshake: HandshakeConfig,
    /// Bound on spawn-to-connected.
    pub start_timeout: Duration,
    /// Wait after each teardown step before escalating.
    pub shutdown_grace: Duration,
    pub allowed_protocols: Vec<WireProtocol>,
    pub network: Network,
    pub socket_dir: Option<PathBuf>,
}

impl LauncherConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            handshake: HandshakeConfig::step(),
            start_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(2),
            allowed_protocols: vec![WireProtocol::Json],
            network: Network::platform_default(),
            socket_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_allowed_protocols(mut self, protocols: Vec<WireProtocol>) -> Self {
        self.allowed_protocols = protocols;
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
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to start plugin {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("plugin did not become ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error("plugin exited before becoming ready ({status})")]
    ExitedBeforeReady { status: String },

    #[error("failed to connect to plugin at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl LaunchError {
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Handshake(_))
    }
}

/// Spawns plugin processes from one configuration.
#[derive(Debug, Clone)]
pub struct PluginLauncher {
    config: LauncherConfig,
}

impl PluginLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    /// Start one plugin process and connect to it.
    pub async fn acquire(&self) -> Result<PluginHandle, LaunchError> {
        let config = &self.config;
        let program = config.program.display().to_string();

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k, v)))
            .envs(config.handshake.host_env())
            .env(NETWORK_ENV, config.network.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.socket_dir {
            command.env(SOCKET_DIR_ENV, dir);
        }

        tracing::debug!(%program, network = %config.network, "Spawning plugin");
        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();

        match self.handshake(&mut child, pid).await {
            Ok((endpoint, conn)) => {
                tracing::info!(pid, %endpoint, "Plugin started");
                let stdin = child.stdin.take();
                Ok(PluginHandle {
                    child,
                    stdin,
                    client: RpcClient::new(conn),
                    pid,
                    endpoint,
                    shutdown_grace: config.shutdown_grace,
                    exit_status: None,
                    released: false,
                })
            }
            Err(e) => {
                tracing::warn!(pid, %program, error = %e, "Plugin failed to start");
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        child: &mut Child,
        pid: u32,
    ) -> Result<(Endpoint, Connection), LaunchError> {
        let config = &self.config;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, pid));
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("plugin stdout not captured"))?;
        let mut lines = BufReader::new(stdout).lines();

        let first = match tokio::time::timeout(config.start_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                let status = match tokio::time::timeout(config.shutdown_grace, child.wait()).await
                {
                    Ok(Ok(status)) => status.to_string(),
                    _ => "stdout closed".to_string(),
                };
                return Err(LaunchError::ExitedBeforeReady { status });
            }
            Ok(Err(e)) => return Err(LaunchError::Io(e)),
            Err(_) => return Err(LaunchError::ReadyTimeout(config.start_timeout)),
        };
        tracing::debug!(pid, line = %first, "Plugin handshake line");

        let ready = config.handshake.parse_signal(&first)?;
        config
            .handshake
            .validate_ready(&ready, &config.allowed_protocols)?;

        // Keep draining stdout so a chatty plugin never blocks on a full pipe.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: PLUGIN_LOG_TARGET, pid, stream = "stdout", "{}", line);
            }
        });

        let endpoint = ready.endpoint;
        let mut socket_dir = SocketDirGuard::new(&endpoint);
        let conn = match tokio::time::timeout(config.start_timeout, Connection::connect(&endpoint))
            .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(source)) => {
                return Err(LaunchError::Connect {
                    endpoint: endpoint.to_string(),
                    source,
                });
            }
            Err(_) => return Err(LaunchError::ReadyTimeout(config.start_timeout)),
        };
        socket_dir.disarm();
        Ok((endpoint, conn))
    }

    /// Scoped acquisition: acquire, run `f`, release on every exit path.
    ///
    /// If `f` panics or the returned future is dropped, the handle's `Drop`
    /// kills the child.
    pub async fn with_plugin<F, Fut, T>(&self, f: F) -> Result<T, LaunchError>
    where
        F: FnOnce(RpcClient) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut handle = self.acquire().await?;
        let out = f(handle.client().clone()).await;
        handle.release().await;
        Ok(out)
    }
}

async fn forward_stderr(stderr: tokio::process::ChildStderr, pid: u32) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!(target: PLUGIN_LOG_TARGET, pid, "{}", line);
    }
}

/// A running, connected plugin process.
///
/// Must be released with `release`; dropping it unreleased kills the child
/// without the graceful steps.
pub struct PluginHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    client: RpcClient,
    pid: u32,
    endpoint: Endpoint,
    shutdown_grace: Duration,
    exit_status: Option<ExitStatus>,
    released: bool,
}

impl PluginHandle {
    /// The RPC client for this process. Clones share the connection.
    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Stop the process and reap it. Idempotent: later calls return the
    /// status from the first.
    ///
    /// Safe while a call is in flight on a clone of the client; that call
    /// fails with a transport error instead of hanging.
    pub async fn release(&mut self) -> Option<ExitStatus> {
        if self.released {
            return self.exit_status;
        }
        self.released = true;
        let grace = self.shutdown_grace;
        let pid = self.pid;

        if let Ok(Err(e)) = tokio::time::timeout(grace, self.client.shutdown()).await {
            tracing::debug!(pid, error = %e, "Could not send shutdown to plugin");
        }
        drop(self.stdin.take());

        let mut status = self.wait_for_exit(grace).await;

        if status.is_none() && send_sigterm(pid) {
            status = self.wait_for_exit(grace).await;
        }

        if status.is_none() {
            tracing::warn!(pid, "Plugin did not exit, killing");
            if let Err(e) = self.child.kill().await {
                tracing::warn!(pid, error = %e, "Failed to kill plugin");
            }
            status = self.child.try_wait().ok().flatten();
        }

        self.client.close();
        remove_socket_dir(&self.endpoint);

        tracing::info!(pid, status = ?status, "Plugin released");
        self.exit_status = status;
        status
    }

    async fn wait_for_exit(&mut self, grace: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::warn!(pid = self.pid, error = %e, "Failed to wait for plugin");
                None
            }
            Err(_) => None,
        }
    }
}

impl Drop for PluginHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!(pid = self.pid, "Plugin handle dropped without release, killing");
        let _ = self.child.start_kill();
        self.client.close();
        remove_socket_dir(&self.endpoint);
    }
}

/// The plugin removes its socket directory on a clean exit; after a kill
/// it is left behind.
fn remove_socket_dir(endpoint: &Endpoint) {
    let Endpoint::Unix(path) = endpoint else {
        return;
    };
    if let Some(dir) = path.parent()
        && dir
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with("stepwire-"))
        && dir.exists()
        && let Err(e) = std::fs::remove_dir_all(dir)
    {
        tracing::debug!(dir = %dir.display(), error = %e, "Failed to remove socket directory");
    }
}

/// Removes an announced socket directory if startup does not complete,
/// including when the `acquire` future is dropped mid-handshake.
struct SocketDirGuard {
    endpoint: Option<Endpoint>,
}

impl SocketDirGuard {
    fn new(endpoint: &Endpoint) -> Self {
        Self {
            endpoint: Some(endpoint.clone()),
        }
    }

    /// Ownership passes to the `PluginHandle`.
    fn disarm(&mut self) {
        self.endpoint = None;
    }
}

impl Drop for SocketDirGuard {
    fn drop(&mut self) {
        if let Some(endpoint) = &self.endpoint {
            remove_socket_dir(endpoint);
        }
    }
}

/// Returns whether a SIGTERM was delivered.
#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    tracing::debug!(pid, "Plugin still running, sending SIGTERM");
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(pid, error = %e, "Failed to send SIGTERM");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> bool {
    false
}
