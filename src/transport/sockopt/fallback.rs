//! Platforms without raw socket tuning support

use std::net::SocketAddr;

use socket2::Socket;
use tokio::net::TcpStream;
use tracing::debug;

use super::{SocketConfig, SocketOptionApplier, TfoState, TproxyMode};
use crate::common::Network;
use crate::error::{Error, Result};

pub struct FallbackApplier;

impl FallbackApplier {
    fn log_ignored(config: &SocketConfig) {
        if config.mark != 0 {
            debug!("socket mark is not supported on this platform");
        }
        if config.tfo != TfoState::AsIs {
            debug!("TCP Fast Open is not supported on this platform");
        }
        if config.tproxy != TproxyMode::Off {
            debug!("transparent proxy is not supported on this platform");
        }
    }
}

impl SocketOptionApplier for FallbackApplier {
    fn apply_outbound(&self, _socket: &Socket, config: &SocketConfig, _network: Network, _target: &SocketAddr) -> Result<()> {
        Self::log_ignored(config);
        Ok(())
    }

    fn apply_inbound(&self, _socket: &Socket, config: &SocketConfig, _network: Network, _bind: &SocketAddr) -> Result<()> {
        Self::log_ignored(config);
        Ok(())
    }

    fn original_destination(&self, _stream: &TcpStream, _mode: TproxyMode) -> Result<SocketAddr> {
        Err(Error::Unsupported("original destination lookup".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_original_destination_unsupported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();

        let err = FallbackApplier
            .original_destination(&stream, TproxyMode::Redirect)
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }
}
