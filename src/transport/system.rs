//! Operating-system level dial and listen primitives
//!
//! Sockets are created with socket2 so the socket option applier sees them
//! before the first connect/bind, then handed to tokio.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpSocket, UdpSocket};
use tracing::debug;

use super::sockopt::{SocketConfig, SocketOptionApplier};
use super::{BoxedConnection, RawConnection, UdpConnection};
use crate::common::{Address, Destination, Network};
use crate::error::Result;

const LISTEN_BACKLOG: i32 = 1024;

/// The lowest-level dialer, replaceable for testing or platform integration
#[async_trait]
pub trait SystemDialer: Send + Sync {
    async fn dial(&self, src: Option<&Address>, dest: &Destination, sockopt: &SocketConfig) -> Result<BoxedConnection>;
}

/// Plain OS sockets tuned by a `SocketOptionApplier`
pub struct DefaultSystemDialer {
    applier: Arc<dyn SocketOptionApplier>,
}

impl DefaultSystemDialer {
    pub fn new(applier: Arc<dyn SocketOptionApplier>) -> Self {
        Self { applier }
    }
}

fn new_socket(addr: &SocketAddr, network: Network) -> Result<Socket> {
    let socket = match network {
        Network::Tcp => Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?,
        Network::Udp => Socket::new(Domain::for_address(*addr), Type::DGRAM, Some(Protocol::UDP))?,
    };
    Ok(socket)
}

fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}

#[async_trait]
impl SystemDialer for DefaultSystemDialer {
    async fn dial(&self, src: Option<&Address>, dest: &Destination, sockopt: &SocketConfig) -> Result<BoxedConnection> {
        let target = dest.address.resolve().await?;
        let socket = new_socket(&target, dest.network)?;
        self.applier.apply_outbound(&socket, sockopt, dest.network, &target)?;

        let bind = match src {
            Some(src) => Some(src.resolve().await?),
            None => None,
        };

        match dest.network {
            Network::Tcp => {
                if let Some(bind) = bind {
                    socket.bind(&bind.into())?;
                }
                socket.set_nonblocking(true)?;
                let socket = TcpSocket::from_std_stream(socket.into());
                let stream = socket.connect(target).await?;
                stream.set_nodelay(true)?;
                debug!("Dialed tcp {} from {:?}", target, stream.local_addr().ok());
                Ok(Box::new(RawConnection::from_tcp(stream)))
            }
            Network::Udp => {
                socket.bind(&bind.unwrap_or_else(|| unspecified_for(&target)).into())?;
                socket.set_nonblocking(true)?;
                let socket = UdpSocket::from_std(socket.into())?;
                socket.connect(target).await?;
                debug!("Dialed udp {}", target);
                Ok(Box::new(UdpConnection::new(socket)?))
            }
        }
    }
}

/// Bind a TCP listener with inbound socket options applied before bind
pub fn listen_tcp(
    addr: SocketAddr,
    sockopt: &SocketConfig,
    applier: &dyn SocketOptionApplier,
) -> Result<tokio::net::TcpListener> {
    let socket = new_socket(&addr, Network::Tcp)?;
    socket.set_reuse_address(true)?;
    applier.apply_inbound(&socket, sockopt, Network::Tcp, &addr)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(tokio::net::TcpListener::from_std(socket.into())?)
}

/// Bind a UDP socket with inbound socket options applied before bind
pub fn listen_udp(addr: SocketAddr, sockopt: &SocketConfig, applier: &dyn SocketOptionApplier) -> Result<UdpSocket> {
    let socket = new_socket(&addr, Network::Udp)?;
    applier.apply_inbound(&socket, sockopt, Network::Udp, &addr)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sockopt::FallbackApplier;
    use crate::transport::Connection;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_dial_tcp_loopback() {
        let applier = FallbackApplier;
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap(), &SocketConfig::default(), &applier).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let dialer = DefaultSystemDialer::new(Arc::new(FallbackApplier));
        let mut conn = dialer
            .dial(None, &Destination::tcp(addr), &SocketConfig::default())
            .await
            .unwrap();
        assert_eq!(conn.remote_addr(), Some(addr));
        conn.write_all(b"ping").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_dial_udp_loopback() {
        let applier = FallbackApplier;
        let server = listen_udp("127.0.0.1:0".parse().unwrap(), &SocketConfig::default(), &applier).unwrap();
        let addr = server.local_addr().unwrap();

        let dialer = DefaultSystemDialer::new(Arc::new(FallbackApplier));
        let mut conn = dialer
            .dial(None, &Destination::udp(addr), &SocketConfig::default())
            .await
            .unwrap();
        conn.write_all(b"datagram").await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"datagram");
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let applier = FallbackApplier;
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap(), &SocketConfig::default(), &applier).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = DefaultSystemDialer::new(Arc::new(FallbackApplier));
        assert!(dialer.dial(None, &Destination::tcp(addr), &SocketConfig::default()).await.is_err());
    }
}
