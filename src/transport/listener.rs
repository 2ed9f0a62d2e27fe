//! TCP and Unix domain socket listeners.
//!
//! # Example
//!
//! ```no_run
//! use milterwire::transport::{ListenAddr, MilterListener};
//!
//! # async fn demo() -> milterwire::Result<()> {
//! let addr: ListenAddr = "unix:/var/run/milter.sock".parse()?;
//! let listener = MilterListener::bind(&addr).await?;
//! let conn = listener.accept().await?;
//! println!("MTA connected from {}", conn.peer);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;

use tokio::io::AsyncRead;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::debug;

use crate::error::{MilterError, Result};
use crate::writer::BoxedWriter;

/// Type-erased read half of a transport.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Where to listen for the MTA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// TCP socket.
    Inet {
        /// Host name or IP literal, without brackets.
        host: String,
        /// TCP port, 0 for an ephemeral one.
        port: u16,
    },
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = MilterError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (scheme, rest) = match s.split_once(':') {
            Some((scheme @ ("inet" | "inet6" | "tcp" | "unix" | "local"), rest)) => (scheme, rest),
            _ if s.starts_with('/') => ("unix", s),
            _ => ("inet", s),
        };

        match scheme {
            "unix" | "local" => {
                if rest.is_empty() {
                    return Err(invalid(s, "empty socket path"));
                }
                Ok(ListenAddr::Unix(PathBuf::from(rest)))
            }
            _ => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| invalid(s, "expected host:port"))?;
                let port = port.parse().map_err(|_| invalid(s, "bad port"))?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(invalid(s, "empty host"));
                }
                Ok(ListenAddr::Inet {
                    host: host.to_string(),
                    port,
                })
            }
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Inet { host, port } if host.contains(':') => {
                write!(f, "inet:[{}]:{}", host, port)
            }
            ListenAddr::Inet { host, port } => write!(f, "inet:{}:{}", host, port),
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

fn invalid(addr: &str, reason: &str) -> MilterError {
    MilterError::Protocol(format!("invalid listen address {:?}: {}", addr, reason))
}

/// An accepted MTA connection, already split.
pub struct Connection {
    /// Read half.
    pub reader: BoxedReader,
    /// Write half.
    pub writer: BoxedWriter,
    /// Peer description for log lines.
    pub peer: String,
}

enum Inner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
}

/// A bound listening socket.
///
/// A Unix socket file is removed before binding and again on drop.
pub struct MilterListener {
    inner: Inner,
}

impl MilterListener {
    /// Bind to `addr`.
    pub async fn bind(addr: &ListenAddr) -> Result<Self> {
        let inner = match addr {
            ListenAddr::Inet { host, port } => {
                Inner::Tcp(TcpListener::bind((host.as_str(), *port)).await?)
            }
            #[cfg(unix)]
            ListenAddr::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Inner::Unix {
                    listener: UnixListener::bind(path)?,
                    path: path.clone(),
                }
            }
            #[cfg(not(unix))]
            ListenAddr::Unix(path) => {
                return Err(MilterError::Io(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    format!("unix sockets unavailable: {}", path.display()),
                )));
            }
        };
        debug!(addr = %addr, "listening");
        Ok(Self { inner })
    }

    /// Accept one connection.
    pub async fn accept(&self) -> Result<Connection> {
        match &self.inner {
            Inner::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok(Connection {
                    reader: Box::pin(reader),
                    writer: Box::pin(writer),
                    peer: peer.to_string(),
                })
            }
            #[cfg(unix)]
            Inner::Unix { listener, path } => {
                let (stream, _peer) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok(Connection {
                    reader: Box::pin(reader),
                    writer: Box::pin(writer),
                    peer: format!("unix:{}", path.display()),
                })
            }
        }
    }

    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> Result<ListenAddr> {
        match &self.inner {
            Inner::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(ListenAddr::Inet {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                })
            }
            #[cfg(unix)]
            Inner::Unix { path, .. } => Ok(ListenAddr::Unix(path.clone())),
        }
    }

    /// Socket file path, for Unix listeners.
    pub fn path(&self) -> Option<&Path> {
        match &self.inner {
            Inner::Tcp(_) => None,
            #[cfg(unix)]
            Inner::Unix { path, .. } => Some(path),
        }
    }
}

impl Drop for MilterListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Inner::Unix { path, .. } = &self.inner {
            let _ = std::fs::remove_file(path);
        }
    }
}
