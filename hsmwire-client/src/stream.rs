//! Client stream abstraction for TCP and caller-supplied transports.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Any byte stream usable as an HSM transport.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// A client stream that is either a TCP socket or an attached transport.
pub enum ClientStream {
    Plain { stream: TcpStream },
    Attached { stream: Box<dyn Transport> },
}

impl ClientStream {
    pub fn attached(stream: impl Transport + 'static) -> Self {
        ClientStream::Attached {
            stream: Box::new(stream),
        }
    }

    /// Returns whether this stream is a TCP socket.
    pub fn is_tcp(&self) -> bool {
        matches!(self, ClientStream::Plain { .. })
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain { stream } => Pin::new(stream).poll_read(cx, buf),
            ClientStream::Attached { stream } => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain { stream } => Pin::new(stream).poll_write(cx, buf),
            ClientStream::Attached { stream } => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain { stream } => Pin::new(stream).poll_flush(cx),
            ClientStream::Attached { stream } => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain { stream } => Pin::new(stream).poll_shutdown(cx),
            ClientStream::Attached { stream } => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
