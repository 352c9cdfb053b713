//! Transport collaborators: address-based listeners, streams and the
//! client-side [`Connect`] seam.
//!
//! The protocol engine only needs a duplex byte stream that preserves byte
//! order and reports EOF and errors distinctly; anything implementing
//! `AsyncRead + AsyncWrite` qualifies. This module supplies the stock
//! transports behind varlink address URIs:
//!
//! - `tcp:HOST:PORT` - TCP
//! - `unix:PATH` - Unix domain socket (optional `;mode=...` suffix ignored)
//! - `unix:@NAME` - abstract Unix socket (Linux only)

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::{Error, Result};

#[cfg(unix)]
enum UnixAddr {
    Path(String),
    #[cfg(target_os = "linux")]
    Abstract(String),
}

#[cfg(unix)]
fn parse_unix_address(addr: &str) -> Result<UnixAddr> {
    let addr = addr.split(';').next().unwrap_or(addr);
    if let Some(name) = addr.strip_prefix('@') {
        #[cfg(target_os = "linux")]
        return Ok(UnixAddr::Abstract(name.to_string()));
        #[cfg(not(target_os = "linux"))]
        return Err(Error::InvalidAddress(format!("unix:@{}", name)));
    }
    Ok(UnixAddr::Path(addr.to_string()))
}

#[cfg(target_os = "linux")]
fn abstract_socket_addr(name: &str) -> Result<std::os::unix::net::SocketAddr> {
    use std::os::linux::net::SocketAddrExt;
    Ok(std::os::unix::net::SocketAddr::from_abstract_name(name)?)
}

/// Listening socket for incoming varlink connections.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    /// Bind a listener for the given varlink address URI.
    pub async fn bind<S: AsRef<str>>(address: S) -> Result<Self> {
        let address = address.as_ref();
        if let Some(addr) = address.strip_prefix("tcp:") {
            Ok(Listener::Tcp(TcpListener::bind(addr).await?))
        } else if let Some(addr) = address.strip_prefix("unix:") {
            #[cfg(unix)]
            {
                match parse_unix_address(addr)? {
                    UnixAddr::Path(path) => {
                        let _ = std::fs::remove_file(&path);
                        Ok(Listener::Unix(UnixListener::bind(path)?))
                    }
                    #[cfg(target_os = "linux")]
                    UnixAddr::Abstract(name) => {
                        let listener =
                            std::os::unix::net::UnixListener::bind_addr(&abstract_socket_addr(&name)?)?;
                        listener.set_nonblocking(true)?;
                        Ok(Listener::Unix(UnixListener::from_std(listener)?))
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = addr;
                Err(Error::InvalidAddress(address.to_string()))
            }
        } else {
            Err(Error::InvalidAddress(address.to_string()))
        }
    }

    /// Accept one connection.
    pub async fn accept(&self) -> Result<Stream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Stream::Tcp(stream))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Stream::Unix(stream))
            }
        }
    }

    /// The bound address as a varlink address URI. Useful after binding
    /// `tcp:127.0.0.1:0` to learn the assigned port.
    pub fn local_address(&self) -> Result<String> {
        match self {
            Listener::Tcp(listener) => Ok(format!("tcp:{}", listener.local_addr()?)),
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let addr = listener.local_addr()?;
                match addr.as_pathname() {
                    Some(path) => Ok(format!("unix:{}", path.display())),
                    None => Err(Error::InvalidAddress("unix:<unnamed>".into())),
                }
            }
        }
    }
}

/// One accepted or connected duplex stream.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// How the client call engine opens raw connections.
///
/// Implementations may be backed by any stream transport; the engine never
/// looks past the returned stream.
#[async_trait]
pub trait Connect: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    async fn connect(&self) -> Result<Self::Stream>;

    /// Idle read timeout applied to every connection opened by this
    /// connector. None disables the timeout.
    fn read_timeout(&self) -> Option<Duration> {
        None
    }
}

/// Stock connector for varlink address URIs.
#[derive(Debug, Clone)]
pub struct Connector {
    address: String,
    read_timeout: Option<Duration>,
}

impl Connector {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Connector {
            address: address.into(),
            read_timeout: None,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Connect for Connector {
    type Stream = Stream;

    async fn connect(&self) -> Result<Stream> {
        if let Some(addr) = self.address.strip_prefix("tcp:") {
            Ok(Stream::Tcp(TcpStream::connect(addr).await?))
        } else if let Some(addr) = self.address.strip_prefix("unix:") {
            #[cfg(unix)]
            {
                match parse_unix_address(addr)? {
                    UnixAddr::Path(path) => Ok(Stream::Unix(UnixStream::connect(path).await?)),
                    #[cfg(target_os = "linux")]
                    UnixAddr::Abstract(name) => {
                        let stream = std::os::unix::net::UnixStream::connect_addr(
                            &abstract_socket_addr(&name)?,
                        )?;
                        stream.set_nonblocking(true)?;
                        Ok(Stream::Unix(UnixStream::from_std(stream)?))
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = addr;
                Err(Error::InvalidAddress(self.address.clone()))
            }
        } else {
            Err(Error::InvalidAddress(self.address.clone()))
        }
    }

    fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }
}
