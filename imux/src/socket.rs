// Stream types a DeviceConnection can hold at any point of its life

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::ReadWrite;

/// A plain stream with bytes that were read ahead and must be served first
#[derive(Debug)]
pub(crate) struct Rewind {
    prefix: Bytes,
    inner: Box<dyn ReadWrite>,
}

impl Rewind {
    pub(crate) fn new(prefix: Bytes, inner: Box<dyn ReadWrite>) -> Self {
        Self { prefix, inner }
    }
}

impl AsyncRead for Rewind {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Rewind {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

pub(crate) enum Socket {
    Plain(Box<dyn ReadWrite>),
    TlsClient(Box<tokio_rustls::client::TlsStream<Rewind>>),
    TlsServer(Box<tokio_rustls::server::TlsStream<Rewind>>),
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Socket::Plain(s) => f.debug_tuple("Plain").field(s).finish(),
            Socket::TlsClient(_) => f.write_str("TlsClient"),
            Socket::TlsServer(_) => f.write_str("TlsServer"),
        }
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Socket::TlsClient(s) => Pin::new(s).poll_read(cx, buf),
            Socket::TlsServer(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Socket::TlsClient(s) => Pin::new(s).poll_write(cx, buf),
            Socket::TlsServer(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_flush(cx),
            Socket::TlsClient(s) => Pin::new(s).poll_flush(cx),
            Socket::TlsServer(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Socket::TlsClient(s) => Pin::new(s).poll_shutdown(cx),
            Socket::TlsServer(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_rewind_serves_prefix_before_stream() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut rewind = Rewind::new(Bytes::from_static(b"head"), Box::new(a));
        b.write_all(b"tail").await.unwrap();
        drop(b);

        let mut out = Vec::new();
        rewind.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"headtail");
    }
}
