//! End-to-end tests against the real `http-step-plugin` binary.

#![cfg(unix)]

use std::time::{Duration, Instant};

use stepwire::{
    CallContext, HandshakeConfig, HandshakeError, LaunchError, LauncherConfig, Network,
    PluginLauncher, PluginPool, RequestEnvelope, StepError, StepInput, StepPlugin,
    TransportError,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PLUGIN: &str = env!("CARGO_BIN_EXE_http-step-plugin");

fn launcher_config() -> LauncherConfig {
    LauncherConfig::new(PLUGIN)
        .with_start_timeout(Duration::from_secs(20))
        .with_shutdown_grace(Duration::from_secs(2))
}

fn request(pairs: &[(&str, &str)]) -> RequestEnvelope {
    RequestEnvelope::from_input(&StepInput::new(pairs.iter().copied())).unwrap()
}

fn process_exists(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn closed_port_uri() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/")
}

#[tokio::test]
async fn get_200_through_plugin() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string("fine"))
        .expect(1)
        .mount(&server)
        .await;

    let uri = format!("{}/status", server.uri());
    let ctx = CallContext::with_timeout(Duration::from_secs(10));
    let output = PluginLauncher::new(launcher_config())
        .with_plugin(|client| async move {
            client
                .run(&ctx, request(&[("uri", &uri), ("method", "GET")]))
                .await
        })
        .await
        .unwrap()
        .unwrap()
        .decode()
        .unwrap();

    assert!(output.success);
    assert!(output.message.contains("Status: 200"), "{}", output.message);
    assert!(output.message.ends_with("Body: fine"));
}

#[tokio::test]
async fn missing_uri_is_configuration_error_and_plugin_survives() {
    let mut handle = PluginLauncher::new(launcher_config())
        .acquire()
        .await
        .unwrap();
    let client = handle.client().clone();
    let ctx = CallContext::background();

    let err = client
        .run(&ctx, request(&[("method", "GET")]))
        .await
        .unwrap_err();
    assert!(err.is_configuration(), "got {err:?}");

    // Not JSON the step understands; still only fails this call.
    let bad = RequestEnvelope::from_bytes(br#"{"config": 7}"#).unwrap();
    let err = client.run(&ctx, bad).await.unwrap_err();
    assert!(matches!(err, StepError::InvalidInput(_)), "got {err:?}");

    let output = client
        .run(&ctx, request(&[("uri", &closed_port_uri()), ("method", "GET")]))
        .await
        .unwrap()
        .decode()
        .unwrap();
    assert!(!output.success);
    assert!(output.message.starts_with("Request error: "));

    handle.release().await;
}

#[tokio::test]
async fn cookie_mismatch_is_rejected() {
    let config =
        launcher_config().with_handshake(HandshakeConfig::new(1, "ARGO_ROLLOUTS_PLUGIN", "canary"));
    let err = PluginLauncher::new(config).acquire().await.err().unwrap();
    assert!(
        matches!(
            err,
            LaunchError::Handshake(HandshakeError::CookieMismatch { .. })
        ),
        "got {err:?}"
    );
}

#[tokio::test]
async fn missing_cookie_is_rejected() {
    let config =
        launcher_config().with_handshake(HandshakeConfig::new(1, "SOME_OTHER_HOST", "step"));
    let err = PluginLauncher::new(config).acquire().await.err().unwrap();
    assert!(
        matches!(
            err,
            LaunchError::Handshake(HandshakeError::MissingCookie { .. })
        ),
        "got {err:?}"
    );
}

#[tokio::test]
async fn version_mismatch_is_rejected() {
    let config =
        launcher_config().with_handshake(HandshakeConfig::new(2, "ARGO_ROLLOUTS_PLUGIN", "step"));
    let err = PluginLauncher::new(config).acquire().await.err().unwrap();
    assert!(
        matches!(
            err,
            LaunchError::Handshake(HandshakeError::VersionMismatch { .. })
        ),
        "got {err:?}"
    );
}

#[tokio::test]
async fn release_leaves_no_process() {
    let mut handle = PluginLauncher::new(launcher_config())
        .acquire()
        .await
        .unwrap();
    let pid = handle.pid();
    assert!(process_exists(pid));

    handle
        .client()
        .ping(&CallContext::background())
        .await
        .unwrap();

    let status = handle.release().await;
    assert!(status.is_some_and(|s| s.success()), "{status:?}");
    assert!(!process_exists(pid));
}

#[tokio::test]
async fn release_during_call_fails_call_promptly() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(8)))
        .mount(&server)
        .await;

    let mut handle = PluginLauncher::new(launcher_config())
        .acquire()
        .await
        .unwrap();
    let client = handle.client().clone();
    let uri = server.uri();
    let call = tokio::spawn(async move {
        client
            .run(
                &CallContext::background(),
                request(&[("uri", &uri), ("method", "GET")]),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let started = Instant::now();
    handle.release().await;

    let err = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("call should not outlive the process")
        .unwrap()
        .unwrap_err();
    assert!(
        matches!(err, StepError::Transport(TransportError::ConnectionClosed)),
        "got {err:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn expired_context_does_not_reach_target() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let uri = server.uri();
    let err = PluginLauncher::new(launcher_config())
        .with_plugin(|client| async move {
            client
                .run(
                    &CallContext::with_timeout(Duration::ZERO),
                    request(&[("uri", &uri), ("method", "GET")]),
                )
                .await
        })
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, StepError::DeadlineExceeded));
}

#[tokio::test]
async fn tcp_network_works() {
    let mut handle = PluginLauncher::new(launcher_config().with_network(Network::Tcp))
        .acquire()
        .await
        .unwrap();
    assert_eq!(handle.endpoint().network(), Network::Tcp);
    handle
        .client()
        .ping(&CallContext::background())
        .await
        .unwrap();
    handle.release().await;
}

#[tokio::test]
async fn socket_dir_is_honoured_and_cleaned() {
    let dir = tempfile::tempdir().unwrap();
    let mut handle = PluginLauncher::new(
        launcher_config()
            .with_network(Network::Unix)
            .with_socket_dir(dir.path()),
    )
    .acquire()
    .await
    .unwrap();
    assert!(handle.endpoint().address().starts_with(&*dir.path().to_string_lossy()));

    handle.release().await;
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn pool_spreads_concurrent_calls_over_processes() {
    let pool = PluginPool::new(PluginLauncher::new(launcher_config()), 2);
    let ctx = CallContext::background();

    let a = pool.checkout(&ctx).await.unwrap();
    let b = pool.checkout(&ctx).await.unwrap();
    assert_ne!(a.pid(), b.pid());
    let pids = [a.pid(), b.pid()];

    let err = a
        .client()
        .run(&ctx, request(&[("method", "GET")]))
        .await
        .unwrap_err();
    assert!(err.is_configuration());
    drop((a, b));
    assert_eq!(pool.idle_count(), 2);

    pool.shutdown().await;
    for pid in pids {
        assert!(!process_exists(pid));
    }
}

#[test]
fn running_plugin_directly_refuses() {
    let output = std::process::Command::new(PLUGIN)
        .env_remove("ARGO_ROLLOUTS_PLUGIN")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("REJECT|missing-cookie|"), "{stdout}");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not meant to be executed directly"), "{stderr}");
}
