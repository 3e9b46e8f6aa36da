//! Linux socket options

use std::net::SocketAddr;

use socket2::{SockRef, Socket};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{setsockopt_int, SocketConfig, SocketOptionApplier, TfoState, TproxyMode};
use crate::common::Network;
use crate::error::{Error, Result};

const TCP_FASTOPEN_CONNECT: libc::c_int = 30;
const IPV6_TRANSPARENT: libc::c_int = 75;
const IPV6_RECVORIGDSTADDR: libc::c_int = 74;

/// Pending connection queue length when TFO is enabled on a listener
const TFO_QUEUE_LEN: libc::c_int = 256;

pub struct LinuxApplier;

impl LinuxApplier {
    fn apply_mark(socket: &Socket, mark: u32) {
        if mark == 0 {
            return;
        }
        if let Err(e) = socket.set_mark(mark) {
            warn!("failed to set SO_MARK {}: {}", mark, e);
        }
    }

    fn apply_transparent(socket: &Socket, addr: &SocketAddr) -> Result<()> {
        // socket2 only covers the IPv4 option
        let result = if addr.is_ipv6() {
            setsockopt_int(socket, libc::SOL_IPV6, IPV6_TRANSPARENT, 1)
        } else {
            socket.set_ip_transparent(true)
        };
        result.map_err(|e| Error::Transport(format!("failed to set transparent mode: {}", e)))
    }
}

impl SocketOptionApplier for LinuxApplier {
    fn apply_outbound(&self, socket: &Socket, config: &SocketConfig, network: Network, target: &SocketAddr) -> Result<()> {
        Self::apply_mark(socket, config.mark);

        if network == Network::Tcp {
            let value = match config.tfo {
                TfoState::AsIs => None,
                TfoState::Enable => Some(1),
                TfoState::Disable => Some(0),
            };
            if let Some(value) = value {
                if let Err(e) = setsockopt_int(socket, libc::SOL_TCP, TCP_FASTOPEN_CONNECT, value) {
                    warn!("failed to set TCP_FASTOPEN_CONNECT: {}", e);
                }
            }
        }

        if config.tproxy == TproxyMode::TProxy {
            Self::apply_transparent(socket, target)?;
        }

        Ok(())
    }

    fn apply_inbound(&self, socket: &Socket, config: &SocketConfig, network: Network, bind: &SocketAddr) -> Result<()> {
        Self::apply_mark(socket, config.mark);

        if network == Network::Tcp {
            let value = match config.tfo {
                TfoState::AsIs => None,
                TfoState::Enable => Some(TFO_QUEUE_LEN),
                TfoState::Disable => Some(0),
            };
            if let Some(value) = value {
                if let Err(e) = setsockopt_int(socket, libc::SOL_TCP, libc::TCP_FASTOPEN, value) {
                    warn!("failed to set TCP_FASTOPEN: {}", e);
                }
            }
        }

        if config.tproxy == TproxyMode::TProxy {
            Self::apply_transparent(socket, bind)?;
        }

        if config.receive_original_dest_address && network == Network::Udp {
            let result = if bind.is_ipv6() {
                setsockopt_int(socket, libc::SOL_IPV6, IPV6_RECVORIGDSTADDR, 1)
            } else {
                setsockopt_int(socket, libc::SOL_IP, libc::IP_RECVORIGDSTADDR, 1)
            };
            if let Err(e) = result {
                warn!("failed to enable original destination reporting: {}", e);
            }
        }

        Ok(())
    }

    fn original_destination(&self, stream: &TcpStream, mode: TproxyMode) -> Result<SocketAddr> {
        if mode == TproxyMode::TProxy {
            // With IP_TRANSPARENT the accepted socket is bound to the original destination
            return Ok(stream.local_addr()?);
        }

        let sock = SockRef::from(stream);
        let is_v6 = stream.local_addr()?.is_ipv6();
        let addr = if is_v6 {
            sock.original_dst_ipv6()?
        } else {
            sock.original_dst()?
        };
        let addr = addr
            .as_socket()
            .ok_or_else(|| Error::Transport("original destination is not an IP address".into()))?;
        debug!("original destination {} (redirect)", addr);
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Protocol, Type};

    fn tcp_socket() -> Socket {
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap()
    }

    #[test]
    fn test_mark_is_set_or_skipped() {
        let socket = tcp_socket();
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let config = SocketConfig {
            mark: 255,
            ..Default::default()
        };
        LinuxApplier.apply_outbound(&socket, &config, Network::Tcp, &target).unwrap();
        // Without CAP_NET_ADMIN the mark stays unset
        let mark = socket.mark().unwrap();
        assert!(mark == 0 || mark == 255, "unexpected mark {}", mark);
    }

    #[test]
    fn test_transparent_failure_is_reported() {
        let socket = tcp_socket();
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let config = SocketConfig {
            tproxy: TproxyMode::TProxy,
            ..Default::default()
        };
        match LinuxApplier.apply_inbound(&socket, &config, Network::Tcp, &bind) {
            Ok(()) => assert!(socket.ip_transparent().unwrap()),
            Err(e) => assert!(matches!(e, Error::Transport(_))),
        }
    }
}
