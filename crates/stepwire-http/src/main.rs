//! http-step-plugin: serves `HttpStep` to a rollout host over the plugin
//! protocol. Not meant to be run by hand.

use std::process;
use std::sync::Arc;

use stepwire::{HandshakeConfig, ServeConfig, init_tracing, serve};
use stepwire_http::HttpStep;

#[tokio::main]
async fn main() {
    init_tracing();

    let handshake = HandshakeConfig::step();
    tracing::info!(
        protocol_version = handshake.protocol_version,
        cookie_key = %handshake.magic_cookie_key,
        "Starting HTTP step plugin"
    );

    if let Err(e) = run(handshake).await {
        tracing::error!(error = %e, "Plugin failed");
        process::exit(1);
    }
}

async fn run(handshake: HandshakeConfig) -> anyhow::Result<()> {
    let step = HttpStep::new()?;
    serve(ServeConfig::new(handshake), Arc::new(step)).await?;
    Ok(())
}
