//! Plugin connection transport.
//!
//! The plugin binds a listener and announces its endpoint in the ready line;
//! the host connects to it. Supported networks:
//! - **Unix**: filesystem socket in a private directory (default on unix)
//! - **Tcp**: loopback listener on an ephemeral port

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::handshake::HandshakeError;

/// Network the host would like the plugin to listen on.
pub const NETWORK_ENV: &str = "PLUGIN_NETWORK";

/// Directory in which the plugin creates its unix socket.
pub const SOCKET_DIR_ENV: &str = "PLUGIN_UNIX_SOCKET_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Unix,
    Tcp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unix => "unix",
            Self::Tcp => "tcp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "unix" => Some(Self::Unix),
            "tcp" => Some(Self::Tcp),
            _ => None,
        }
    }

    pub fn platform_default() -> Self {
        if cfg!(unix) { Self::Unix } else { Self::Tcp }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Framing and encoding spoken over the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    /// Length-prefixed JSON frames (see `JsonCodec`).
    Json,
}

impl WireProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a plugin is listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Endpoint {
    pub fn network(&self) -> Network {
        match self {
            Self::Unix(_) => Network::Unix,
            Self::Tcp(_) => Network::Tcp,
        }
    }

    pub fn address(&self) -> String {
        match self {
            Self::Unix(path) => path.display().to_string(),
            Self::Tcp(addr) => addr.to_string(),
        }
    }

    pub fn parse(network: &str, addr: &str) -> Result<Self, HandshakeError> {
        match Network::parse(network) {
            Some(Network::Unix) if addr.is_empty() => {
                Err(HandshakeError::Malformed("empty unix socket path".to_string()))
            }
            Some(Network::Unix) => Ok(Self::Unix(PathBuf::from(addr))),
            Some(Network::Tcp) => addr.parse().map(Self::Tcp).map_err(|_| {
                HandshakeError::Malformed(format!("bad tcp address '{addr}'"))
            }),
            None => Err(HandshakeError::UnsupportedNetwork(network.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network(), self.address())
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A live byte stream between host and plugin, already split into halves.
pub struct Connection {
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl Connection {
    /// Wrap any duplex stream (sockets, in-memory pipes in tests).
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    fn from_tcp(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    #[cfg(unix)]
    fn from_unix(stream: tokio::net::UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Connect from host side.
    pub async fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        tracing::trace!(%endpoint, "Connecting to plugin");
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Self::from_unix(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                Ok(Self::from_tcp(stream))
            }
        }
    }

    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }
}

enum ListenerKind {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
    Tcp(TcpListener),
}

/// Plugin-side listener.
///
/// Unix socket path format: `{socket_dir}/stepwire-{uuid}/plugin.sock`. The
/// directory is removed when the listener is dropped.
pub struct PluginListener {
    kind: ListenerKind,
    endpoint: Endpoint,
    socket_dir: Option<PathBuf>,
}

impl PluginListener {
    pub async fn bind(network: Network, socket_dir: Option<&Path>) -> io::Result<Self> {
        match network {
            #[cfg(unix)]
            Network::Unix => Self::bind_unix(socket_dir),
            #[cfg(not(unix))]
            Network::Unix => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
            Network::Tcp => {
                let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
                let addr = listener.local_addr()?;
                tracing::debug!(network = "tcp", %addr, "Plugin listener bound");
                Ok(Self {
                    kind: ListenerKind::Tcp(listener),
                    endpoint: Endpoint::Tcp(addr),
                    socket_dir: None,
                })
            }
        }
    }

    #[cfg(unix)]
    fn bind_unix(socket_dir: Option<&Path>) -> io::Result<Self> {
        let base = socket_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let dir = base.join(format!("stepwire-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir)?;

        let path = dir.join("plugin.sock");
        let listener = match tokio::net::UnixListener::bind(&path) {
            Ok(l) => l,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dir);
                return Err(e);
            }
        };

        tracing::debug!(network = "unix", path = %path.display(), "Plugin listener bound");
        Ok(Self {
            kind: ListenerKind::Unix(listener),
            endpoint: Endpoint::Unix(path),
            socket_dir: Some(dir),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn accept(&self) -> io::Result<Connection> {
        match &self.kind {
            #[cfg(unix)]
            ListenerKind::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection::from_unix(stream))
            }
            ListenerKind::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                if !peer.ip().is_loopback() {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("refusing non-loopback peer {peer}"),
                    ));
                }
                Ok(Connection::from_tcp(stream))
            }
        }
    }

    pub fn cleanup(&mut self) -> io::Result<()> {
        if let Some(dir) = self.socket_dir.take()
            && dir.exists()
        {
            tracing::debug!(dir = %dir.display(), "Cleaning up socket directory");
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

impl Drop for PluginListener {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "Failed to cleanup socket directory");
        }
    }
}
