//! UDP carrier
//!
//! A connected UDP socket exposed as a `Connection`: each write is one
//! datagram, each read drains one datagram (buffering whatever the caller's
//! buffer could not take).

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::{
    timed_out, BoxedConnection, Connection, Deadline, ResolvedStream, TransportContext, TransportDialer, TransportSettings,
};
use crate::common::{Address, Destination};
use crate::error::Result;

const MAX_DATAGRAM: usize = 65535;

/// The `udp` carrier has no settings of its own
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpSettings {}

impl TransportSettings for UdpSettings {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Connected UDP socket as a stream-like connection
pub struct UdpConnection {
    socket: UdpSocket,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_len: usize,
    read_deadline: Deadline,
    write_deadline: Deadline,
    closed: bool,
}

impl UdpConnection {
    pub fn new(socket: UdpSocket) -> io::Result<Self> {
        let local = socket.local_addr().ok();
        let remote = Some(socket.peer_addr()?);
        Ok(Self {
            socket,
            local,
            remote,
            read_buf: vec![0u8; MAX_DATAGRAM],
            read_pos: 0,
            read_len: 0,
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
            closed: false,
        })
    }
}

impl AsyncRead for UdpConnection {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.read_pos < this.read_len {
            let to_copy = (this.read_len - this.read_pos).min(buf.remaining());
            buf.put_slice(&this.read_buf[this.read_pos..this.read_pos + to_copy]);
            this.read_pos += to_copy;
            return Poll::Ready(Ok(()));
        }
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        if this.read_deadline.poll_expired(cx).is_ready() {
            return Poll::Ready(Err(timed_out()));
        }

        let mut recv_buf = ReadBuf::new(&mut this.read_buf);
        if let Err(e) = ready!(this.socket.poll_recv(cx, &mut recv_buf)) {
            this.closed = true;
            return Poll::Ready(Err(e));
        }
        this.read_len = recv_buf.filled().len();

        let to_copy = this.read_len.min(buf.remaining());
        buf.put_slice(&this.read_buf[..to_copy]);
        this.read_pos = to_copy;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for UdpConnection {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.closed {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "udp connection closed")));
        }
        if this.write_deadline.poll_expired(cx).is_ready() {
            return Poll::Ready(Err(timed_out()));
        }
        this.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.closed = true;
        Poll::Ready(Ok(()))
    }
}

impl Connection for UdpConnection {
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

/// Dialer behind every UDP destination
pub struct UdpDialer;

#[async_trait]
impl TransportDialer for UdpDialer {
    async fn dial(
        &self,
        ctx: &TransportContext,
        src: Option<&Address>,
        dest: &Destination,
        stream: &ResolvedStream,
    ) -> Result<BoxedConnection> {
        ctx.dial_system(src, dest, &stream.socket).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn connected_pair() -> (UdpConnection, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(peer.local_addr().unwrap()).await.unwrap();
        peer.connect(socket.local_addr().unwrap()).await.unwrap();
        (UdpConnection::new(socket).unwrap(), peer)
    }

    #[tokio::test]
    async fn test_datagram_is_buffered_across_reads() {
        let (mut conn, peer) = connected_pair().await;
        peer.send(b"0123456789").await.unwrap();

        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"0123");
        let mut rest = [0u8; 6];
        conn.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"456789");
    }

    #[tokio::test]
    async fn test_write_sends_datagram() {
        let (mut conn, peer) = connected_pair().await;
        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (mut conn, _peer) = connected_pair().await;
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));
        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_shutdown_closes() {
        let (mut conn, _peer) = connected_pair().await;
        conn.shutdown().await.unwrap();
        assert!(conn.is_closed());
        assert!(conn.write_all(b"x").await.is_err());
    }
}
