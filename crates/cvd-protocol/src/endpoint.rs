//! Endpoint addressing and listeners.
//!
//! `@name` is an abstract Unix socket, anything containing `/` is a
//! filesystem Unix socket, and `host:port` is an inet4 TCP address.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::{ProtocolError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Filesystem Unix domain socket.
    Unix(PathBuf),
    /// Abstract Unix domain socket (Linux), without the leading `@`.
    Abstract(String),
    /// inet4 TCP.
    Tcp(SocketAddr),
}

impl FromStr for Endpoint {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(ProtocolError::InvalidEndpoint(s.to_string()));
        }
        if let Some(name) = s.strip_prefix('@') {
            if name.is_empty() {
                return Err(ProtocolError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::Abstract(name.to_string()));
        }
        if s.contains('/') {
            return Ok(Endpoint::Unix(PathBuf::from(s)));
        }
        match s.parse::<SocketAddr>() {
            Ok(addr) if addr.is_ipv4() => Ok(Endpoint::Tcp(addr)),
            _ => Err(ProtocolError::InvalidEndpoint(s.to_string())),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Abstract(name) => write!(f, "@{name}"),
            Endpoint::Tcp(addr) => write!(f, "{addr}"),
        }
    }
}

/// Connection trait object both listener flavors hand out.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

pub enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Endpoint {
    /// Bind a listener. A stale filesystem socket from a previous run
    /// is removed first.
    pub async fn bind(&self) -> Result<Listener> {
        match self {
            Endpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Ok(Listener::Unix(UnixListener::bind(path)?))
            }
            Endpoint::Abstract(name) => Ok(Listener::Unix(bind_abstract(name)?)),
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
        }
    }

    pub async fn connect(&self) -> Result<Box<dyn Conn>> {
        match self {
            Endpoint::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
            Endpoint::Abstract(name) => Ok(Box::new(connect_abstract(name).await?)),
            Endpoint::Tcp(addr) => Ok(Box::new(TcpStream::connect(addr).await?)),
        }
    }
}

impl Listener {
    pub async fn accept(&self) -> Result<Box<dyn Conn>> {
        match self {
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let std_listener = std::os::unix::net::UnixListener::bind_addr(&addr)?;
    std_listener.set_nonblocking(true)?;
    Ok(UnixListener::from_std(std_listener)?)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(name: &str) -> Result<UnixListener> {
    Err(ProtocolError::InvalidEndpoint(format!("@{name}")))
}

#[cfg(target_os = "linux")]
async fn connect_abstract(name: &str) -> Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
    std_stream.set_nonblocking(true)?;
    Ok(UnixStream::from_std(std_stream)?)
}

#[cfg(not(target_os = "linux"))]
async fn connect_abstract(name: &str) -> Result<UnixStream> {
    Err(ProtocolError::InvalidEndpoint(format!("@{name}")))
}
