//! Wire protocol types for host-plugin communication.
//!
//! One connection per plugin process. The host sends calls tagged with a
//! sequence number; the plugin answers each with a reply carrying the same
//! number. Messages are externally tagged so payloads can stay raw JSON.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// The single remote-callable method.
pub const RUN_METHOD: &str = "Plugin.Run";

/// Messages from host to plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostMessage {
    Call {
        seq: u64,
        method: String,
        payload: Box<RawValue>,
    },

    /// Liveness check, answered with `Pong`.
    Ping { seq: u64 },

    /// Ask the plugin to stop serving and exit.
    Shutdown,
}

/// Messages from plugin to host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginMessage {
    /// Outcome of a call. Exactly one of `payload` and `error` is set.
    Reply {
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Box<RawValue>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },

    Pong { seq: u64 },

    ShuttingDown,
}

impl PluginMessage {
    pub fn success(seq: u64, payload: Box<RawValue>) -> Self {
        Self::Reply {
            seq,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(seq: u64, error: RemoteError) -> Self {
        Self::Reply {
            seq,
            payload: None,
            error: Some(error),
        }
    }

    /// Sequence number this message answers, if any.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::Reply { seq, .. } | Self::Pong { seq } => Some(*seq),
            Self::ShuttingDown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// Required configuration missing or unusable.
    Configuration,
    /// Request payload could not be decoded.
    InvalidInput,
    /// The step implementation failed.
    Execution,
    UnknownMethod,
}

impl RemoteErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::InvalidInput => "invalid_input",
            Self::Execution => "execution",
            Self::UnknownMethod => "unknown_method",
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by the plugin for a single call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
