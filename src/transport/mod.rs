//! Transport module - display names and the sockets behind them.
//!
//! Provides:
//! - [`DisplayName`] parsing and its [`Endpoint`]
//! - [`XStream`], a Unix or TCP stream behind one type

mod display;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::error::Result;

pub use display::{DisplayName, Endpoint, TCP_PORT_BASE, UNIX_SOCKET_DIR};

/// A connected stream to a display server.
#[derive(Debug)]
pub enum XStream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl XStream {
    /// Connect to an endpoint.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        tracing::debug!(?endpoint, "connecting");
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Self::Unix(UnixStream::connect(path).await?)),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )
            .into()),
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Ok(Self::Tcp(stream))
            }
        }
    }
}

impl AsyncRead for XStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            XStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            XStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for XStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            XStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            XStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            XStream::Unix(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
            XStream::Tcp(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            #[cfg(unix)]
            XStream::Unix(stream) => stream.is_write_vectored(),
            XStream::Tcp(stream) => stream.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            XStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
            XStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            XStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            XStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
