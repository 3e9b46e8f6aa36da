//! FreeBSD socket options

use std::net::SocketAddr;

use socket2::Socket;
use tokio::net::TcpStream;
use tracing::warn;

use super::{setsockopt_int, SocketConfig, SocketOptionApplier, TfoState, TproxyMode};
use crate::common::Network;
use crate::error::{Error, Result};

const SO_USER_COOKIE: libc::c_int = 0x1015;
const TCP_FASTOPEN: libc::c_int = 1025;
const IP_BINDANY: libc::c_int = 24;
const IPV6_BINDANY: libc::c_int = 64;

pub struct FreeBsdApplier;

impl FreeBsdApplier {
    fn apply_common(socket: &Socket, config: &SocketConfig, network: Network, addr: &SocketAddr) -> Result<()> {
        if config.mark != 0 {
            if let Err(e) = setsockopt_int(socket, libc::SOL_SOCKET, SO_USER_COOKIE, config.mark as libc::c_int) {
                warn!("failed to set SO_USER_COOKIE {}: {}", config.mark, e);
            }
        }

        if network == Network::Tcp && config.tfo != TfoState::AsIs {
            let value = (config.tfo == TfoState::Enable) as libc::c_int;
            if let Err(e) = setsockopt_int(socket, libc::IPPROTO_TCP, TCP_FASTOPEN, value) {
                warn!("failed to set TCP_FASTOPEN: {}", e);
            }
        }

        if config.tproxy == TproxyMode::TProxy {
            let result = if addr.is_ipv6() {
                setsockopt_int(socket, libc::IPPROTO_IPV6, IPV6_BINDANY, 1)
            } else {
                setsockopt_int(socket, libc::IPPROTO_IP, IP_BINDANY, 1)
            };
            result.map_err(|e| Error::Transport(format!("failed to set IP_BINDANY: {}", e)))?;
        }

        Ok(())
    }
}

impl SocketOptionApplier for FreeBsdApplier {
    fn apply_outbound(&self, socket: &Socket, config: &SocketConfig, network: Network, target: &SocketAddr) -> Result<()> {
        Self::apply_common(socket, config, network, target)
    }

    fn apply_inbound(&self, socket: &Socket, config: &SocketConfig, network: Network, bind: &SocketAddr) -> Result<()> {
        Self::apply_common(socket, config, network, bind)
    }

    fn original_destination(&self, stream: &TcpStream, mode: TproxyMode) -> Result<SocketAddr> {
        match mode {
            TproxyMode::TProxy => Ok(stream.local_addr()?),
            _ => Err(Error::Unsupported("original destination lookup for pf redirect".into())),
        }
    }
}
