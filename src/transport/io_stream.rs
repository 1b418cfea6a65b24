use std::cmp;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// An opaque bidirectional byte stream.
///
/// The bridging core is byte-opaque: it never frames or parses what flows
/// through one of these. `Tcp` carries a live proxied connection, `InMemory`
/// carries a `tokio::io::duplex` half, and `Replay` serves bytes that were
/// read past a handshake boundary before handing off to the underlying
/// stream.
pub enum IoStream {
    Tcp(TcpStream),
    InMemory(DuplexStream),
    Replay(Box<Replay>),
}

impl IoStream {
    /// Wrap a stream so that `prefix` is read back before any fresh bytes.
    pub fn replay(prefix: Bytes, inner: IoStream) -> IoStream {
        if prefix.is_empty() {
            inner
        } else {
            IoStream::Replay(Box::new(Replay {
                prefix: Some(prefix),
                inner,
            }))
        }
    }
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::InMemory(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Replay(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::InMemory(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Replay(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::InMemory(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Replay(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::InMemory(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Replay(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl From<TcpStream> for IoStream {
    fn from(stream: TcpStream) -> Self {
        IoStream::Tcp(stream)
    }
}

impl From<DuplexStream> for IoStream {
    fn from(stream: DuplexStream) -> Self {
        IoStream::InMemory(stream)
    }
}

/// A stream with a buffer of already-read bytes in front of it. Reads drain
/// the buffer first; writes go straight through.
pub struct Replay {
    prefix: Option<Bytes>,
    inner: IoStream,
}

impl AsyncRead for Replay {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(mut prefix) = this.prefix.take() {
            if !prefix.is_empty() {
                let copy_len = cmp::min(prefix.len(), buf.remaining());
                buf.put_slice(&prefix[..copy_len]);
                prefix.advance(copy_len);
                // Put back what's left.
                if !prefix.is_empty() {
                    this.prefix = Some(prefix);
                }
                return Poll::Ready(Ok(()));
            }
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Replay {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn replayed_bytes_come_back_first() {
        let (near, far) = tokio::io::duplex(64);
        let mut stream = IoStream::replay(Bytes::from_static(b"head"), IoStream::from(near));

        let mut far = IoStream::from(far);
        far.write_all(b"tail").await.unwrap();

        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"headtail");
    }

    #[tokio::test]
    async fn replay_serves_partial_reads() {
        let (near, _far) = tokio::io::duplex(64);
        let mut stream = IoStream::replay(Bytes::from_static(b"abcd"), IoStream::from(near));

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ab");
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"cd");
    }

    #[tokio::test]
    async fn empty_prefix_is_elided() {
        let (near, _far) = tokio::io::duplex(64);
        let stream = IoStream::replay(Bytes::new(), IoStream::from(near));
        assert!(matches!(stream, IoStream::InMemory(_)));
    }
}
