//! Helpers for exercising the launcher and pool without a plugin binary.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bridge::transport::{Network, PluginListener};
use crate::capability::{RequestEnvelope, ResponseEnvelope, StepError, StepPlugin};
use crate::context::CallContext;
use crate::launcher::LauncherConfig;
use crate::server::RpcServer;

/// Answers every call with the request it was given.
pub struct Echo;

#[async_trait::async_trait]
impl StepPlugin for Echo {
    async fn run(
        &self,
        _ctx: &CallContext,
        request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, StepError> {
        Ok(ResponseEnvelope::from_raw(request.into_raw()))
    }
}

pub fn shell(script: &str) -> LauncherConfig {
    LauncherConfig::new("/bin/sh")
        .with_args(["-c", script])
        .with_start_timeout(Duration::from_secs(5))
        .with_shutdown_grace(Duration::from_millis(200))
}

pub fn process_exists(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// An `Echo` server listening in-process, announced by a shell child that
/// prints the ready line and then idles. Every launch gets its own child
/// and its own connection to the shared listener.
pub async fn fake_plugin(dir: &Path) -> (LauncherConfig, CancellationToken) {
    let listener = PluginListener::bind(Network::Unix, Some(dir))
        .await
        .unwrap();
    let line = format!("1|1|unix|{}|json", listener.endpoint().address());
    let token = CancellationToken::new();

    let stop = token.clone();
    tokio::spawn(async move {
        loop {
            let conn = tokio::select! {
                conn = listener.accept() => conn.unwrap(),
                _ = stop.cancelled() => return,
            };
            let server = Arc::new(RpcServer::new(Arc::new(Echo)));
            tokio::spawn(server.serve_connection(conn, stop.child_token()));
        }
    });

    let script = format!("printf '%s\\n' '{line}'; exec sleep 30");
    (shell(&script), token)
}
