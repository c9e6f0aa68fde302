//! Plugin handshake - proves a spawned child is a compatible plugin.
//!
//! Flow:
//! 1. Host exports the magic cookie and its offered protocol versions
//! 2. Plugin checks them (`validate_host_env`) before doing anything else
//! 3. Plugin prints one line on stdout: a ready line or a rejection
//! 4. Host parses the line (`parse_signal`) and checks versions, network and
//!    wire protocol (`validate_ready`) before any call is sent
//!
//! The cookie is a usability guard against launching the wrong binary. It is
//! not authentication.

use std::fmt;

use crate::bridge::transport::{Endpoint, WireProtocol};

/// Version of the handshake line format itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Comma-separated list of application protocol versions offered by the host.
pub const PROTOCOL_VERSIONS_ENV: &str = "PLUGIN_PROTOCOL_VERSIONS";

pub const STEP_PROTOCOL_VERSION: u32 = 1;
pub const STEP_COOKIE_KEY: &str = "ARGO_ROLLOUTS_PLUGIN";
pub const STEP_COOKIE_VALUE: &str = "step";

const REJECT_PREFIX: &str = "REJECT";

/// Shared handshake values. Both sides must hold identical values.
///
/// Built once in `main` and passed explicitly to the launcher or `serve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    pub protocol_version: u32,
    pub magic_cookie_key: String,
    pub magic_cookie_value: String,
}

impl HandshakeConfig {
    pub fn new(
        protocol_version: u32,
        magic_cookie_key: impl Into<String>,
        magic_cookie_value: impl Into<String>,
    ) -> Self {
        Self {
            protocol_version,
            magic_cookie_key: magic_cookie_key.into(),
            magic_cookie_value: magic_cookie_value.into(),
        }
    }

    /// The compiled-in values for rollout step plugins.
    pub fn step() -> Self {
        Self::new(STEP_PROTOCOL_VERSION, STEP_COOKIE_KEY, STEP_COOKIE_VALUE)
    }

    /// Environment the host exports to the child.
    pub fn host_env(&self) -> Vec<(String, String)> {
        vec![
            (
                self.magic_cookie_key.clone(),
                self.magic_cookie_value.clone(),
            ),
            (
                PROTOCOL_VERSIONS_ENV.to_string(),
                self.protocol_version.to_string(),
            ),
        ]
    }

    /// Plugin-side check of the environment set by the host.
    ///
    /// Returns the negotiated application protocol version. A missing version
    /// list means the host predates negotiation; our own version is assumed.
    pub fn validate_host_env<F>(&self, lookup: F) -> Result<u32, HandshakeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(&self.magic_cookie_key) {
            None => {
                return Err(HandshakeError::MissingCookie {
                    key: self.magic_cookie_key.clone(),
                });
            }
            Some(value) if value != self.magic_cookie_value => {
                return Err(HandshakeError::CookieMismatch {
                    key: self.magic_cookie_key.clone(),
                });
            }
            Some(_) => {}
        }

        let Some(offered) = lookup(PROTOCOL_VERSIONS_ENV) else {
            return Ok(self.protocol_version);
        };

        let accepted = offered
            .split(',')
            .filter_map(|v| v.trim().parse::<u32>().ok())
            .any(|v| v == self.protocol_version);

        if accepted {
            Ok(self.protocol_version)
        } else {
            Err(HandshakeError::VersionMismatch {
                host: offered.trim().to_string(),
                plugin: self.protocol_version.to_string(),
            })
        }
    }

    /// Host-side check of the plugin's ready line.
    pub fn validate_ready(
        &self,
        ready: &ReadyLine,
        allowed_protocols: &[WireProtocol],
    ) -> Result<(), HandshakeError> {
        if ready.core_version != CORE_PROTOCOL_VERSION {
            return Err(HandshakeError::CoreVersionMismatch {
                expected: CORE_PROTOCOL_VERSION,
                actual: ready.core_version,
            });
        }
        if ready.app_version != self.protocol_version {
            return Err(HandshakeError::VersionMismatch {
                host: self.protocol_version.to_string(),
                plugin: ready.app_version.to_string(),
            });
        }
        if !allowed_protocols.contains(&ready.protocol) {
            return Err(HandshakeError::UnsupportedProtocol(
                ready.protocol.as_str().to_string(),
            ));
        }
        Ok(())
    }

    /// Host-side interpretation of the first stdout line from the plugin.
    ///
    /// Rejections are mapped back onto the error the plugin hit, filling in
    /// the host's own view of the versions.
    pub fn parse_signal(&self, line: &str) -> Result<ReadyLine, HandshakeError> {
        let line = line.trim();
        if let Some(rest) = line
            .strip_prefix(REJECT_PREFIX)
            .and_then(|r| r.strip_prefix('|'))
        {
            let (reason, detail) = rest.split_once('|').unwrap_or((rest, ""));
            return Err(match reason {
                "missing-cookie" => HandshakeError::MissingCookie {
                    key: self.magic_cookie_key.clone(),
                },
                "cookie-mismatch" => HandshakeError::CookieMismatch {
                    key: self.magic_cookie_key.clone(),
                },
                "version-mismatch" => HandshakeError::VersionMismatch {
                    host: self.protocol_version.to_string(),
                    plugin: detail.to_string(),
                },
                other => HandshakeError::Malformed(format!("unknown rejection '{other}'")),
            });
        }
        line.parse()
    }
}

/// The line a plugin prints once it is listening.
///
/// Format: `CORE|APP|NETWORK|ADDR|PROTOCOL`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyLine {
    pub core_version: u32,
    pub app_version: u32,
    pub endpoint: Endpoint,
    pub protocol: WireProtocol,
}

impl fmt::Display for ReadyLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_version,
            self.app_version,
            self.endpoint.network(),
            self.endpoint.address(),
            self.protocol
        )
    }
}

impl std::str::FromStr for ReadyLine {
    type Err = HandshakeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let malformed = || {
            HandshakeError::Malformed(format!("expected 5 '|'-separated fields: {line:?}"))
        };
        let mut head = line.splitn(4, '|');
        let (Some(core), Some(app), Some(network), Some(rest)) =
            (head.next(), head.next(), head.next(), head.next())
        else {
            return Err(malformed());
        };
        // The address is the only field that may itself contain '|'.
        let (addr, protocol) = rest.rsplit_once('|').ok_or_else(malformed)?;

        let core_version = core
            .parse()
            .map_err(|_| HandshakeError::Malformed(format!("bad core version '{core}'")))?;
        let app_version = app
            .parse()
            .map_err(|_| HandshakeError::Malformed(format!("bad protocol version '{app}'")))?;
        let endpoint = Endpoint::parse(network, addr)?;
        let protocol = WireProtocol::parse(protocol)
            .ok_or_else(|| HandshakeError::UnsupportedProtocol(protocol.to_string()))?;

        Ok(Self {
            core_version,
            app_version,
            endpoint,
            protocol,
        })
    }
}

/// Handshake failures. All are fatal to the connection attempt.
///
/// Cookie errors mean "wrong binary"; version errors mean "stale binary".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("magic cookie {key} is not set: binary was not launched as a plugin by a compatible host")]
    MissingCookie { key: String },

    #[error("magic cookie {key} has the wrong value: this is not the expected plugin")]
    CookieMismatch { key: String },

    #[error("incompatible plugin protocol version: host speaks {host}, plugin speaks {plugin}")]
    VersionMismatch { host: String, plugin: String },

    #[error("incompatible handshake format: expected core version {expected}, got {actual}")]
    CoreVersionMismatch { expected: u32, actual: u32 },

    #[error("unsupported wire protocol '{0}'")]
    UnsupportedProtocol(String),

    #[error("unsupported network '{0}'")]
    UnsupportedNetwork(String),

    #[error("malformed handshake line: {0}")]
    Malformed(String),
}

impl HandshakeError {
    /// Line the plugin prints on stdout when it refuses the host.
    ///
    /// Only plugin-side failures have one.
    pub fn reject_line(&self) -> Option<String> {
        let (reason, detail) = match self {
            Self::MissingCookie { key } => ("missing-cookie", key.as_str()),
            Self::CookieMismatch { key } => ("cookie-mismatch", key.as_str()),
            Self::VersionMismatch { plugin, .. } => ("version-mismatch", plugin.as_str()),
            _ => return None,
        };
        Some(format!("{REJECT_PREFIX}|{reason}|{detail}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    fn ready(app_version: u32) -> ReadyLine {
        ReadyLine {
            core_version: CORE_PROTOCOL_VERSION,
            app_version,
            endpoint: Endpoint::Unix(PathBuf::from("/tmp/stepwire-abc/plugin.sock")),
            protocol: WireProtocol::Json,
        }
    }

    #[test]
    fn host_env_is_accepted_by_matching_plugin() {
        let config = HandshakeConfig::step();
        let exported = config.host_env();
        let pairs: Vec<(&str, &str)> = exported
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        assert_eq!(config.validate_host_env(env(&pairs)), Ok(1));
    }

    #[test]
    fn missing_cookie_is_distinct_from_wrong_cookie() {
        let config = HandshakeConfig::step();

        let missing = config.validate_host_env(env(&[(PROTOCOL_VERSIONS_ENV, "1")]));
        assert!(matches!(missing, Err(HandshakeError::MissingCookie { .. })));

        let wrong = config.validate_host_env(env(&[
            (STEP_COOKIE_KEY, "metric"),
            (PROTOCOL_VERSIONS_ENV, "1"),
        ]));
        assert!(matches!(wrong, Err(HandshakeError::CookieMismatch { .. })));
    }

    #[test]
    fn version_negotiation_picks_own_version_from_offer() {
        let config = HandshakeConfig::new(2, "K", "V");
        let negotiated = config.validate_host_env(env(&[("K", "V"), (PROTOCOL_VERSIONS_ENV, "1, 2,3")]));
        assert_eq!(negotiated, Ok(2));
    }

    #[test]
    fn version_not_offered_is_rejected() {
        let config = HandshakeConfig::step();
        let err = config
            .validate_host_env(env(&[(STEP_COOKIE_KEY, "step"), (PROTOCOL_VERSIONS_ENV, "2")]))
            .unwrap_err();
        assert_eq!(
            err,
            HandshakeError::VersionMismatch {
                host: "2".into(),
                plugin: "1".into()
            }
        );
    }

    #[test]
    fn absent_version_list_accepts_own_version() {
        let config = HandshakeConfig::step();
        assert_eq!(
            config.validate_host_env(env(&[(STEP_COOKIE_KEY, "step")])),
            Ok(1)
        );
    }

    #[test]
    fn ready_line_display_and_parse_agree() {
        let line = ready(1).to_string();
        assert_eq!(line, "1|1|unix|/tmp/stepwire-abc/plugin.sock|json");
        assert_eq!(line.parse::<ReadyLine>().unwrap(), ready(1));
    }

    #[test]
    fn socket_path_with_separator_survives_the_ready_line() {
        let line = ReadyLine {
            endpoint: Endpoint::Unix(PathBuf::from("/tmp/a|b/stepwire-abc/plugin.sock")),
            ..ready(1)
        };
        let parsed: ReadyLine = line.to_string().parse().unwrap();
        assert_eq!(parsed, line);
    }

    #[test]
    fn tcp_ready_line_parses() {
        let parsed: ReadyLine = "1|1|tcp|127.0.0.1:40123|json\n".parse().unwrap();
        assert_eq!(
            parsed.endpoint,
            Endpoint::Tcp("127.0.0.1:40123".parse().unwrap())
        );
    }

    #[test]
    fn garbage_line_is_malformed() {
        let err = "hello world".parse::<ReadyLine>().unwrap_err();
        assert!(matches!(err, HandshakeError::Malformed(_)));

        let err = "x|1|unix|/tmp/s|json".parse::<ReadyLine>().unwrap_err();
        assert!(matches!(err, HandshakeError::Malformed(_)));
    }

    #[test]
    fn unknown_network_and_protocol_are_reported() {
        let err = "1|1|pipe|x|json".parse::<ReadyLine>().unwrap_err();
        assert_eq!(err, HandshakeError::UnsupportedNetwork("pipe".into()));

        let err = "1|1|tcp|127.0.0.1:1|grpc".parse::<ReadyLine>().unwrap_err();
        assert_eq!(err, HandshakeError::UnsupportedProtocol("grpc".into()));
    }

    #[test]
    fn validate_ready_checks_versions() {
        let config = HandshakeConfig::step();
        assert!(config.validate_ready(&ready(1), &[WireProtocol::Json]).is_ok());

        let err = config
            .validate_ready(&ready(3), &[WireProtocol::Json])
            .unwrap_err();
        assert!(matches!(err, HandshakeError::VersionMismatch { .. }));

        let mut old_core = ready(1);
        old_core.core_version = 0;
        let err = config
            .validate_ready(&old_core, &[WireProtocol::Json])
            .unwrap_err();
        assert_eq!(
            err,
            HandshakeError::CoreVersionMismatch {
                expected: 1,
                actual: 0
            }
        );
    }

    #[test]
    fn validate_ready_honours_allowed_protocols() {
        let config = HandshakeConfig::step();
        let err = config.validate_ready(&ready(1), &[]).unwrap_err();
        assert_eq!(err, HandshakeError::UnsupportedProtocol("json".into()));
    }

    #[test]
    fn rejection_lines_map_back_to_error_kinds() {
        let host = HandshakeConfig::step();

        let cases = [
            HandshakeError::MissingCookie {
                key: STEP_COOKIE_KEY.into(),
            },
            HandshakeError::CookieMismatch {
                key: STEP_COOKIE_KEY.into(),
            },
            HandshakeError::VersionMismatch {
                host: "1".into(),
                plugin: "7".into(),
            },
        ];
        for err in cases {
            let line = err.reject_line().unwrap();
            assert_eq!(host.parse_signal(&line).unwrap_err(), err, "line {line}");
        }
    }

    #[test]
    fn host_side_errors_have_no_reject_line() {
        assert!(HandshakeError::Malformed("x".into()).reject_line().is_none());
        assert!(
            HandshakeError::UnsupportedProtocol("grpc".into())
                .reject_line()
                .is_none()
        );
    }
}
