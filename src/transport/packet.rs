//! Obfuscated datagram socket
//!
//! A UDP socket whose datagrams pass through an authenticator chain:
//! `send_to` seals, `recv_from` opens and silently drops anything that
//! does not open. Packet-based carriers (mKCP, QUIC) run on top of this.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::trace;

use crate::auth::Authenticator;
use crate::error::Result;

const MAX_DATAGRAM: usize = 65535;

pub struct ObfuscatedPacketConn {
    socket: UdpSocket,
    auth: Arc<dyn Authenticator>,
    /// Receive buffer reused across `recv_from` calls
    recv_buf: Mutex<BytesMut>,
}

impl ObfuscatedPacketConn {
    pub fn new(socket: UdpSocket, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            socket,
            auth,
            recv_buf: Mutex::new(BytesMut::with_capacity(MAX_DATAGRAM)),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Largest payload that still fits one datagram after sealing
    pub fn max_payload(&self) -> usize {
        MAX_DATAGRAM.saturating_sub(self.auth.overhead())
    }

    /// Seal `payload` and send it; returns the payload length
    pub async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<usize> {
        let mut packet = BytesMut::with_capacity(payload.len() + self.auth.overhead());
        packet.extend_from_slice(payload);
        self.auth.seal(&mut packet)?;
        self.socket.send_to(&packet, target).await?;
        Ok(payload.len())
    }

    /// Receive the next datagram that opens; payload beyond `buf` is discarded
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let mut packet = self.recv_buf.lock().await;
        loop {
            packet.clear();
            packet.reserve(MAX_DATAGRAM);
            let (_, from) = self.socket.recv_buf_from(&mut *packet).await?;
            if !self.auth.open(&mut packet) {
                trace!("Dropped undecodable datagram from {}", from);
                continue;
            }
            let len = packet.len().min(buf.len());
            buf[..len].copy_from_slice(&packet[..len]);
            return Ok((len, from));
        }
    }
}
