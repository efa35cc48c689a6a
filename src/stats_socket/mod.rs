//! A thin byte-counting wrapper around a client [`TcpStream`].
//!
//! Every byte read from or written to the wrapped socket is tallied so the
//! connection handler can report per-host traffic stats without threading
//! counters through every read/write call site.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Shared, cloneable byte counters for one connection.
#[derive(Clone, Default)]
pub struct TrafficCounters {
    bytes_in: Arc<AtomicU64>,
    bytes_out: Arc<AtomicU64>,
}

impl TrafficCounters {
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

/// Wraps a [`TcpStream`], counting bytes read (`bytes_in`, client -> us) and
/// bytes written (`bytes_out`, us -> client).
pub struct StatsSocket {
    inner: TcpStream,
    counters: TrafficCounters,
}

impl StatsSocket {
    pub fn new(inner: TcpStream) -> Self {
        Self {
            inner,
            counters: TrafficCounters::default(),
        }
    }

    pub fn counters(&self) -> TrafficCounters {
        self.counters.clone()
    }

    /// Unwraps back into the raw stream, e.g. before handing it to the
    /// backend splicer where per-direction byte counting takes over.
    pub fn into_inner(self) -> TcpStream {
        self.inner
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.inner
    }
}

impl AsyncRead for StatsSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let read = buf.filled().len() - before;
            this.counters.bytes_in.fetch_add(read as u64, Ordering::Relaxed);
        }
        result
    }
}

impl AsyncWrite for StatsSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            this.counters.bytes_out.fetch_add(*n as u64, Ordering::Relaxed);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn counts_bytes_in_and_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
        });

        let client = TcpStream::connect(addr).await.unwrap();
        let mut stats = StatsSocket::new(client);
        stats.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = stats.read(&mut buf).await.unwrap();

        server.await.unwrap();

        assert_eq!(n, 5);
        assert_eq!(stats.counters().bytes_out(), 5);
        assert_eq!(stats.counters().bytes_in(), 5);
    }
}
