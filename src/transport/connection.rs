//! Connection contract shared by every carrier
//!
//! A connection is an async byte stream plus the bookkeeping the transport
//! layer needs: endpoint addresses, deadlines and the reuse flag. Closing is
//! `shutdown()` followed by drop; wrappers that pool connections decide at
//! that point whether the socket goes back to a cache or to the OS.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::{Instant, Sleep};

use crate::error::Error;

/// A transport connection
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Reads pending past `deadline` fail with `TimedOut`. `None` clears it.
    fn set_read_deadline(&mut self, deadline: Option<Instant>);

    /// Writes pending past `deadline` fail with `TimedOut`. `None` clears it.
    fn set_write_deadline(&mut self, deadline: Option<Instant>);

    fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Whether closing this connection should hand it to a reuse cache
    fn reusable(&self) -> bool {
        false
    }

    fn set_reusable(&mut self, _reusable: bool) {}

    /// Whether the connection has observed EOF, an error, or a shutdown
    fn is_closed(&self) -> bool {
        false
    }
}

/// The boxed connection type handed between layers
pub type BoxedConnection = Box<dyn Connection>;

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn local_addr(&self) -> Option<SocketAddr> {
        (**self).local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        (**self).remote_addr()
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        (**self).set_read_deadline(deadline)
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        (**self).set_write_deadline(deadline)
    }

    fn reusable(&self) -> bool {
        (**self).reusable()
    }

    fn set_reusable(&mut self, reusable: bool) {
        (**self).set_reusable(reusable)
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

/// Close a connection: shut the write side down, then release it.
pub async fn close(mut conn: BoxedConnection) -> io::Result<()> {
    let result = conn.shutdown().await;
    drop(conn);
    result
}

/// A deadline timer that is only armed while a deadline is set
#[derive(Default)]
pub(crate) struct Deadline {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    pub(crate) fn set(&mut self, deadline: Option<Instant>) {
        self.sleep = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    /// Ready(()) once the deadline has passed
    pub(crate) fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx),
            None => Poll::Pending,
        }
    }
}

pub(crate) fn timed_out() -> io::Error {
    Error::Timeout.into()
}

/// Connection over any async stream (TCP, Unix, TLS, in-memory)
pub struct RawConnection<S> {
    inner: S,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    read_deadline: Deadline,
    write_deadline: Deadline,
    closed: bool,
}

impl<S> RawConnection<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            local: None,
            remote: None,
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
            closed: false,
        }
    }

    pub fn with_addrs(mut self, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
        self.local = local;
        self.remote = remote;
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl RawConnection<tokio::net::TcpStream> {
    pub fn from_tcp(stream: tokio::net::TcpStream) -> Self {
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        Self::new(stream).with_addrs(local, remote)
    }
}

impl<S> AsyncRead for RawConnection<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.read_deadline.poll_expired(cx).is_ready() {
            return Poll::Ready(Err(timed_out()));
        }

        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(ref r) = result {
            if r.is_err() || (buf.filled().len() == before && buf.remaining() > 0) {
                this.closed = true;
            }
        }
        result
    }
}

impl<S> AsyncWrite for RawConnection<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.write_deadline.poll_expired(cx).is_ready() {
            return Poll::Ready(Err(timed_out()));
        }

        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Err(_)) = result {
            this.closed = true;
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.write_deadline.poll_expired(cx).is_ready() {
            return Poll::Ready(Err(timed_out()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let result = Pin::new(&mut this.inner).poll_shutdown(cx);
        if result.is_ready() {
            this.closed = true;
        }
        result
    }
}

impl<S> Connection for RawConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline.set(deadline);
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline.set(deadline);
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_raw_connection_passthrough() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut conn: BoxedConnection = Box::new(RawConnection::new(a));

        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert!(!conn.reusable());
        assert!(!conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline() {
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = RawConnection::new(a);
        conn.set_read_deadline(Some(Instant::now() + Duration::from_secs(1)));

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(matches!(err.get_ref().and_then(|e| e.downcast_ref::<Error>()), Some(Error::Timeout)));

        conn.set_read_deadline(None);
        let pending = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf)).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_eof_marks_closed() {
        let (a, b) = tokio::io::duplex(64);
        let mut conn = RawConnection::new(a);
        drop(b);

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_shuts_down() {
        let (a, mut b) = tokio::io::duplex(64);
        close(Box::new(RawConnection::new(a))).await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }
}
