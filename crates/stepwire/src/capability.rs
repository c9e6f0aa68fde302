//! The step capability contract and the envelopes it exchanges.
//!
//! `StepPlugin` is implemented directly by step implementations (in the
//! plugin process, or in-process in the host) and by `RpcClient`, which
//! forwards each call to a plugin process. Callers pick one at composition
//! time and cannot tell them apart except by latency and failure mode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::bridge::TransportError;
use crate::bridge::protocol::{RemoteError, RemoteErrorKind};
use crate::context::{CallContext, Cancellation};

#[async_trait::async_trait]
pub trait StepPlugin: Send + Sync + 'static {
    /// Execute one unit of work.
    ///
    /// Execution failures the step can describe (e.g. the target was
    /// unreachable) belong in the response payload; `Err` is for calls that
    /// could not be carried out at all.
    async fn run(
        &self,
        ctx: &CallContext,
        request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, StepError>;
}

#[async_trait::async_trait]
impl<T: StepPlugin + ?Sized> StepPlugin for std::sync::Arc<T> {
    async fn run(
        &self,
        ctx: &CallContext,
        request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, StepError> {
        (**self).run(ctx, request).await
    }
}

/// Decoded request: `{"config": {<string>: <string>, ...}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInput {
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl StepInput {
    pub fn new<I, K, V>(config: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            config: config
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }
}

/// Decoded response: `{"message": <string>, "success": <bool>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutput {
    pub message: String,
    pub success: bool,
}

impl StepOutput {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: true,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: false,
        }
    }
}

/// Opaque request document. Moved, never shared, across the channel.
#[derive(Debug, Clone)]
pub struct RequestEnvelope(Box<RawValue>);

impl RequestEnvelope {
    pub fn from_input(input: &StepInput) -> Result<Self, StepError> {
        serde_json::value::to_raw_value(input)
            .map(Self)
            .map_err(|e| StepError::InvalidInput(format!("failed to encode input: {e}")))
    }

    /// Accept any JSON document; its shape is checked by the step.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StepError> {
        serde_json::from_slice::<Box<RawValue>>(bytes)
            .map(Self)
            .map_err(|e| StepError::InvalidInput(format!("request is not JSON: {e}")))
    }

    pub fn from_raw(raw: Box<RawValue>) -> Self {
        Self(raw)
    }

    pub fn decode(&self) -> Result<StepInput, StepError> {
        serde_json::from_str(self.0.get())
            .map_err(|e| StepError::InvalidInput(format!("failed to parse input: {e}")))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.get().as_bytes()
    }

    pub fn into_raw(self) -> Box<RawValue> {
        self.0
    }
}

/// Opaque response document.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope(Box<RawValue>);

impl ResponseEnvelope {
    pub fn from_output(output: &StepOutput) -> Result<Self, StepError> {
        serde_json::value::to_raw_value(output)
            .map(Self)
            .map_err(|e| StepError::Execution(format!("failed to encode output: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StepError> {
        serde_json::from_slice::<Box<RawValue>>(bytes)
            .map(Self)
            .map_err(|e| StepError::Execution(format!("response is not JSON: {e}")))
    }

    pub fn from_raw(raw: Box<RawValue>) -> Self {
        Self(raw)
    }

    pub fn decode(&self) -> Result<StepOutput, StepError> {
        serde_json::from_str(self.0.get())
            .map_err(|e| StepError::Execution(format!("failed to parse output: {e}")))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.get().as_bytes()
    }

    pub fn into_raw(self) -> Box<RawValue> {
        self.0
    }
}

/// Call-level failures.
///
/// Configuration errors come from the step before any work is attempted and
/// keep their kind when they cross the process boundary.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("step execution failed: {0}")]
    Execution(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("plugin unavailable: {0}")]
    Unavailable(String),

    #[error("call cancelled")]
    Cancelled,

    #[error("call deadline exceeded")]
    DeadlineExceeded,
}

impl StepError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// Form sent back to the host by the plugin.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Self::Configuration(m) => RemoteError::new(RemoteErrorKind::Configuration, m.clone()),
            Self::InvalidInput(m) => RemoteError::new(RemoteErrorKind::InvalidInput, m.clone()),
            Self::UnknownMethod(m) => RemoteError::new(RemoteErrorKind::UnknownMethod, m.clone()),
            Self::Execution(m) => RemoteError::new(RemoteErrorKind::Execution, m.clone()),
            other => RemoteError::new(RemoteErrorKind::Execution, other.to_string()),
        }
    }
}

impl From<RemoteError> for StepError {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            RemoteErrorKind::Configuration => Self::Configuration(err.message),
            RemoteErrorKind::InvalidInput => Self::InvalidInput(err.message),
            RemoteErrorKind::Execution => Self::Execution(err.message),
            RemoteErrorKind::UnknownMethod => Self::UnknownMethod(err.message),
        }
    }
}

impl From<Cancellation> for StepError {
    fn from(reason: Cancellation) -> Self {
        match reason {
            Cancellation::Cancelled => Self::Cancelled,
            Cancellation::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}
