//! HTTP-fetch step: one outbound request per call.
//!
//! Config keys: `uri` and `method` (required), `body` (optional).
//!
//! Missing or unusable keys fail the call with a configuration error before
//! any network attempt. A network failure is a *successful* call whose
//! payload has `success: false`. A completed exchange reports the status
//! line and body, with `success` set for 2xx.

use std::time::Duration;

use stepwire::{
    CallContext, Cancellation, RequestEnvelope, ResponseEnvelope, StepError, StepInput,
    StepOutput, StepPlugin,
};

/// Ceiling on one request, independent of the caller's context.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const URI_KEY: &str = "uri";
pub const METHOD_KEY: &str = "method";
pub const BODY_KEY: &str = "body";

pub struct HttpStep {
    client: reqwest::Client,
}

impl HttpStep {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("stepwire-http/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Validate the config and perform the request.
    pub async fn execute(
        &self,
        ctx: &CallContext,
        input: &StepInput,
    ) -> Result<StepOutput, StepError> {
        let (Some(uri), Some(method)) = (input.get(URI_KEY), input.get(METHOD_KEY)) else {
            return Err(StepError::configuration(
                "missing 'uri' or 'method' in config",
            ));
        };

        let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|e| {
            StepError::configuration(format!("failed to create request: {e}: {method:?}"))
        })?;
        let url = reqwest::Url::parse(uri)
            .map_err(|e| StepError::configuration(format!("failed to create request: {e}")))?;

        let mut request = self.client.request(method.clone(), url);
        if let Some(body) = input.get(BODY_KEY) {
            request = request.body(body.to_string());
        }

        tracing::debug!(%method, uri, "Sending request");
        let outcome = tokio::select! {
            sent = request.send() => sent,
            reason = ctx.done() => {
                let label = match reason {
                    Cancellation::Cancelled => "call cancelled",
                    Cancellation::DeadlineExceeded => "call deadline exceeded",
                };
                return Ok(StepOutput::failed(format!("Request error: {label}")));
            }
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(%method, uri, error = %e, "Request failed");
                return Ok(StepOutput::failed(format!(
                    "Request error: {}",
                    error_chain(&e)
                )));
            }
        };

        let status = response.status();
        let body = match response.bytes().await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::warn!(%status, error = %e, "Failed to read response body");
                String::new()
            }
        };
        tracing::debug!(%status, body_bytes = body.len(), "Response received");

        Ok(StepOutput {
            message: format!("Status: {}\nBody: {}", status_line(status), body),
            success: status.is_success(),
        })
    }
}

#[async_trait::async_trait]
impl StepPlugin for HttpStep {
    async fn run(
        &self,
        ctx: &CallContext,
        request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, StepError> {
        let input = request.decode()?;
        let output = self.execute(ctx, &input).await?;
        ResponseEnvelope::from_output(&output)
    }
}

/// `200 OK`, or just the code when it has no canonical reason.
fn status_line(status: reqwest::StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_str(), reason),
        None => status.as_str().to_string(),
    }
}

/// reqwest's top-level message hides the cause ("error sending request");
/// append the sources so the payload says what went wrong.
fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn input(pairs: &[(&str, &str)]) -> StepInput {
        StepInput::new(pairs.iter().copied())
    }

    /// An address nothing listens on.
    fn closed_port_uri() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn get_200_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let step = HttpStep::new().unwrap();
        let uri = format!("{}/health", server.uri());
        let out = step
            .execute(
                &CallContext::background(),
                &input(&[("uri", &uri), ("method", "GET")]),
            )
            .await
            .unwrap();

        assert!(out.success);
        assert_eq!(out.message, "Status: 200 OK\nBody: ok");
    }

    #[tokio::test]
    async fn non_2xx_is_failure_with_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let step = HttpStep::new().unwrap();
        let out = step
            .execute(
                &CallContext::background(),
                &input(&[("uri", &server.uri()), ("method", "DELETE")]),
            )
            .await
            .unwrap();

        assert!(!out.success);
        assert!(out.message.starts_with("Status: 503"), "{}", out.message);
        assert!(out.message.ends_with("Body: down"));
    }

    #[tokio::test]
    async fn body_key_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_string("{\"ok\":true}"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let step = HttpStep::new().unwrap();
        let uri = format!("{}/hook", server.uri());
        let out = step
            .execute(
                &CallContext::background(),
                &input(&[("uri", &uri), ("method", "POST"), ("body", "{\"ok\":true}")]),
            )
            .await
            .unwrap();
        assert!(out.success, "{}", out.message);
    }

    #[tokio::test]
    async fn missing_keys_fail_before_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let step = HttpStep::new().unwrap();
        let uri = server.uri();
        for pairs in [vec![("method", "GET")], vec![("uri", uri.as_str())], vec![]] {
            let err = step
                .execute(&CallContext::background(), &input(&pairs))
                .await
                .unwrap_err();
            assert!(err.is_configuration(), "got {err:?}");
            assert_eq!(
                err.to_string(),
                "configuration error: missing 'uri' or 'method' in config"
            );
        }
    }

    #[tokio::test]
    async fn bad_uri_or_method_is_configuration_error() {
        let step = HttpStep::new().unwrap();
        let ctx = CallContext::background();

        let err = step
            .execute(&ctx, &input(&[("uri", "::nope"), ("method", "GET")]))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("failed to create request"));

        let err = step
            .execute(&ctx, &input(&[("uri", "http://localhost/"), ("method", "GE T")]))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn unreachable_host_is_failure_payload() {
        let step = HttpStep::new().unwrap();
        let out = step
            .execute(
                &CallContext::background(),
                &input(&[("uri", &closed_port_uri()), ("method", "GET")]),
            )
            .await
            .unwrap();

        assert!(!out.success);
        assert!(out.message.starts_with("Request error: "), "{}", out.message);
    }

    #[tokio::test]
    async fn internal_timeout_is_failure_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let step = HttpStep::with_timeout(Duration::from_millis(100)).unwrap();
        let out = step
            .execute(
                &CallContext::background(),
                &input(&[("uri", &server.uri()), ("method", "GET")]),
            )
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.message.starts_with("Request error: "));
    }

    #[tokio::test]
    async fn caller_deadline_cuts_request_short() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let step = HttpStep::new().unwrap();
        let ctx = CallContext::with_timeout(Duration::from_millis(100));
        let out = step
            .execute(&ctx, &input(&[("uri", &server.uri()), ("method", "GET")]))
            .await
            .unwrap();
        assert_eq!(out, StepOutput::failed("Request error: call deadline exceeded"));
    }

    #[tokio::test]
    async fn run_decodes_and_encodes_envelopes() {
        let step = HttpStep::new().unwrap();
        let bad = RequestEnvelope::from_bytes(br#"{"config": "nope"}"#).unwrap();
        let err = step.run(&CallContext::background(), bad).await.unwrap_err();
        assert!(matches!(err, StepError::InvalidInput(ref m) if m.starts_with("failed to parse input")));
    }

    #[test]
    fn status_line_includes_reason() {
        assert_eq!(status_line(reqwest::StatusCode::NOT_FOUND), "404 Not Found");
        assert_eq!(
            status_line(reqwest::StatusCode::from_u16(299).unwrap()),
            "299"
        );
    }
}
