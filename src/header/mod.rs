//! Disguise headers
//!
//! Two families live here:
//! - `PacketHeader`: a fixed-size prefix written in front of every datagram
//!   so UDP-carried traffic looks like SRTP, uTP, WeChat video, DTLS or
//!   WireGuard on the wire.
//! - `ConnectionAuthenticator`: a stream-level wrapper applied once when a
//!   connection is established (e.g. a fake HTTP/1.1 exchange).

mod dtls;
pub mod http;
mod srtp;
mod utp;
mod wechat;
mod wireguard;

pub use dtls::DtlsHeader;
pub use http::{HttpAuthenticator, HttpHeaderConfig};
pub use srtp::SrtpHeader;
pub use utp::UtpHeader;
pub use wechat::WechatVideoHeader;
pub use wireguard::WireguardHeader;

use std::sync::Arc;

use crate::error::Result;
use crate::registry::RegistryBuilder;
use crate::transport::BoxedConnection;

/// A fixed-size packet disguise
///
/// `size()` never changes over the lifetime of a header. `write` fills
/// exactly `size()` bytes and may advance internal counters between calls.
pub trait PacketHeader: Send + Sync {
    fn size(&self) -> usize;

    /// Write the next header into `buf[..self.size()]`, returning the bytes written.
    ///
    /// `buf` must be at least `size()` bytes long.
    fn write(&self, buf: &mut [u8]) -> usize;
}

/// Stream-level disguise applied at connection establishment
pub trait ConnectionAuthenticator: Send + Sync {
    fn client(&self, conn: BoxedConnection) -> BoxedConnection;
    fn server(&self, conn: BoxedConnection) -> BoxedConnection;
}

/// No header at all
pub struct NoopHeader;

impl PacketHeader for NoopHeader {
    fn size(&self) -> usize {
        0
    }

    fn write(&self, _buf: &mut [u8]) -> usize {
        0
    }
}

/// Connection authenticator that leaves the stream untouched
pub struct NoopConnectionAuthenticator;

impl ConnectionAuthenticator for NoopConnectionAuthenticator {
    fn client(&self, conn: BoxedConnection) -> BoxedConnection {
        conn
    }

    fn server(&self, conn: BoxedConnection) -> BoxedConnection {
        conn
    }
}

fn noop_connection_authenticator(_config: &serde_json::Value) -> Result<Arc<dyn ConnectionAuthenticator>> {
    Ok(Arc::new(NoopConnectionAuthenticator))
}

fn http_connection_authenticator(config: &serde_json::Value) -> Result<Arc<dyn ConnectionAuthenticator>> {
    let config = HttpHeaderConfig::from_json(config)?;
    Ok(Arc::new(HttpAuthenticator::new(config)))
}

/// Register every built-in packet header and connection authenticator
pub fn register_builtin(builder: &mut RegistryBuilder) -> Result<()> {
    builder.register_header("none", || Box::new(NoopHeader))?;
    builder.register_header("srtp", || Box::new(SrtpHeader::new()))?;
    builder.register_header("utp", || Box::new(UtpHeader::new()))?;
    builder.register_header("wechat-video", || Box::new(WechatVideoHeader::new()))?;
    builder.register_header("wireguard", || Box::new(WireguardHeader))?;
    builder.register_header("dtls", || Box::new(DtlsHeader::new()))?;

    builder.register_connection_authenticator("none", noop_connection_authenticator)?;
    builder.register_connection_authenticator("http", http_connection_authenticator)?;
    Ok(())
}
