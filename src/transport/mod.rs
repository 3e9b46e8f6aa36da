//! Transport layer
//!
//! Everything between "I need a byte stream to this destination" and a
//! connected socket: the carrier registry seams, stream settings
//! resolution, the dialer façade, listener hubs, connection reuse and
//! per-OS socket tuning.
//!
//! Carriers plug in through three traits:
//! - `TransportSettings`: opaque, carrier-owned settings
//! - `TransportDialer`: opens outbound connections
//! - `TransportBinder`: binds a `Listener` that accepts inbound connections

mod cache;
mod carriers;
mod connection;
mod dialer;
mod domainsocket;
mod hub;
mod packet;
pub mod sockopt;
mod stream;
mod system;
mod tcp;
pub mod tls;
mod udp;
mod websocket;

pub use cache::{ConnectionCache, PooledConnection, DEFAULT_CACHE_TTL, DEFAULT_SWEEP_INTERVAL};
pub use carriers::{HttpSettings, KcpSettings, QuicSettings};
pub use connection::{close, BoxedConnection, Connection, RawConnection};
pub use dialer::{DialerOptions, ProxyDialer, TransportContext};
pub use domainsocket::{DomainSocketBinder, DomainSocketDialer, DomainSocketSettings};
pub use hub::{AcceptBackoff, ConnHandler, Hub, HubState};
pub use packet::ObfuscatedPacketConn;
pub use stream::{ResolvedStream, SecuritySettings, StreamSettings, TransportConfig};
pub use system::{DefaultSystemDialer, SystemDialer};
pub use tcp::{TcpBinder, TcpDialer, TcpHeaderSettings, TcpSettings};
pub use tls::TlsSettings;
pub use udp::{UdpConnection, UdpDialer, UdpSettings};
pub use websocket::{WebSocketBinder, WebSocketConnection, WebSocketDialer, WebSocketSettings};

pub(crate) use connection::{timed_out, Deadline};

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::common::{Address, Destination};
use crate::error::{Error, Result};
use crate::registry::RegistryBuilder;

/// Carrier-specific settings, downcast by the carrier that owns them
pub trait TransportSettings: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Opens outbound connections for one carrier
#[async_trait]
pub trait TransportDialer: Send + Sync {
    async fn dial(
        &self,
        ctx: &TransportContext,
        src: Option<&Address>,
        dest: &Destination,
        stream: &ResolvedStream,
    ) -> Result<BoxedConnection>;
}

/// Binds listeners for one carrier
#[async_trait]
pub trait TransportBinder: Send + Sync {
    async fn bind(&self, ctx: &TransportContext, addr: &Address, stream: &ResolvedStream) -> Result<Box<dyn Listener>>;
}

/// A bound listener
///
/// `accept` hands back the raw connection as soon as the OS does; any
/// per-connection handshake (TLS, header, WebSocket upgrade) happens in
/// `upgrade`, which the hub runs on the connection's own task so a slow
/// peer never stalls the accept loop.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<BoxedConnection>;

    async fn upgrade(&self, conn: BoxedConnection) -> Result<BoxedConnection> {
        Ok(conn)
    }

    fn local_addr(&self) -> Result<Address>;

    async fn close(&self) -> Result<()>;
}

/// Shared settings factory: decode a JSON blob, or the zero value
fn settings_factory<T>(json: Option<&serde_json::Value>) -> Result<Arc<dyn TransportSettings>>
where
    T: TransportSettings + Default + DeserializeOwned,
{
    let settings = match json {
        Some(value) => serde_json::from_value::<T>(value.clone())
            .map_err(|e| Error::Config(format!("invalid transport settings: {}", e)))?,
        None => T::default(),
    };
    Ok(Arc::new(settings))
}

/// Register the built-in carriers
///
/// `mkcp`, `http` and `quic` only contribute settings factories: their
/// engines live outside this crate and register dialers of their own. The
/// obfuscated datagram socket those engines run on comes from
/// `TransportContext::listen_packet`.
pub fn register_builtin(builder: &mut RegistryBuilder) -> Result<()> {
    builder.register_transport("tcp", settings_factory::<TcpSettings>)?;
    builder.register_transport("udp", settings_factory::<UdpSettings>)?;
    builder.register_transport("mkcp", settings_factory::<KcpSettings>)?;
    builder.register_transport("websocket", settings_factory::<WebSocketSettings>)?;
    builder.register_transport("http", settings_factory::<HttpSettings>)?;
    builder.register_transport("domainsocket", settings_factory::<DomainSocketSettings>)?;
    builder.register_transport("quic", settings_factory::<QuicSettings>)?;

    builder.register_dialer("tcp", Arc::new(TcpDialer::new()))?;
    builder.register_dialer("udp", Arc::new(UdpDialer))?;
    builder.register_dialer("websocket", Arc::new(WebSocketDialer::new()))?;
    builder.register_dialer("domainsocket", Arc::new(DomainSocketDialer))?;

    builder.register_listener("tcp", Arc::new(TcpBinder))?;
    builder.register_listener("websocket", Arc::new(WebSocketBinder))?;
    builder.register_listener("domainsocket", Arc::new(DomainSocketBinder))?;
    Ok(())
}
