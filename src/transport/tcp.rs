//! TCP carrier
//!
//! Plain TCP with optional TLS and an optional connection authenticator
//! (`header.type`) layered on top. Outbound connections go through the
//! reuse cache.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::sockopt::{SocketOptionApplier, TproxyMode};
use super::tls::{self, TlsSettings};
use super::{
    BoxedConnection, ConnectionCache, Listener, RawConnection, ResolvedStream, TransportBinder, TransportContext,
    TransportDialer, TransportSettings,
};
use crate::common::{Address, Destination};
use crate::error::{Error, Result};
use crate::header::ConnectionAuthenticator;
use crate::registry::Registry;

/// `header` block of the tcp settings: authenticator name plus its own fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpHeaderSettings {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl Default for TcpHeaderSettings {
    fn default() -> Self {
        Self {
            kind: "none".into(),
            settings: serde_json::Map::new(),
        }
    }
}

impl TcpHeaderSettings {
    pub fn authenticator(&self, registry: &Registry) -> Result<Arc<dyn ConnectionAuthenticator>> {
        let kind = if self.kind.is_empty() { "none" } else { self.kind.as_str() };
        registry.create_connection_authenticator(kind, &serde_json::Value::Object(self.settings.clone()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TcpSettings {
    pub header: TcpHeaderSettings,
}

impl TransportSettings for TcpSettings {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Outbound side of the `tcp` carrier
#[derive(Default)]
pub struct TcpDialer {
    cache: ConnectionCache,
}

impl TcpDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }
}

#[async_trait]
impl TransportDialer for TcpDialer {
    async fn dial(
        &self,
        ctx: &TransportContext,
        src: Option<&Address>,
        dest: &Destination,
        stream: &ResolvedStream,
    ) -> Result<BoxedConnection> {
        let key = ConnectionCache::key(src, dest, &stream.fingerprint());
        if let Some(conn) = self.cache.get(&key) {
            debug!("Reusing cached tcp connection to {}", dest);
            return Ok(Box::new(self.cache.wrap(key, conn)));
        }

        let settings = stream.settings::<TcpSettings>()?;
        let authenticator = settings.header.authenticator(ctx.registry())?;

        let mut conn = ctx.dial_system(src, dest, &stream.socket).await?;
        if let Some(tls) = stream.tls() {
            conn = tls.client(conn, dest).await?;
        }
        let conn = authenticator.client(conn);
        Ok(Box::new(self.cache.wrap(key, conn)))
    }
}

/// Inbound side of the `tcp` carrier
pub struct TcpBinder;

#[async_trait]
impl TransportBinder for TcpBinder {
    async fn bind(&self, ctx: &TransportContext, addr: &Address, stream: &ResolvedStream) -> Result<Box<dyn Listener>> {
        let settings = stream.settings::<TcpSettings>()?;
        let authenticator = settings.header.authenticator(ctx.registry())?;
        let acceptor = stream.tls().map(TlsSettings::acceptor).transpose()?;

        let listener = ctx.listen_system_tcp(addr, &stream.socket).await?;
        let local_addr = listener.local_addr()?;
        debug!("tcp listener bound on {}", local_addr);

        Ok(Box::new(TcpStreamListener {
            listener: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            authenticator,
            acceptor,
            applier: ctx.applier().clone(),
            tproxy: stream.socket.tproxy,
        }))
    }
}

struct TcpStreamListener {
    listener: Mutex<Option<Arc<tokio::net::TcpListener>>>,
    local_addr: SocketAddr,
    authenticator: Arc<dyn ConnectionAuthenticator>,
    acceptor: Option<TlsAcceptor>,
    applier: Arc<dyn SocketOptionApplier>,
    tproxy: TproxyMode,
}

#[async_trait]
impl Listener for TcpStreamListener {
    async fn accept(&self) -> Result<BoxedConnection> {
        let listener = self.listener.lock().clone().ok_or(Error::ConnectionClosed)?;
        let (stream, remote) = listener.accept().await?;
        stream.set_nodelay(true)?;

        // Under transparent proxying the local address reports the original destination
        let local = match self.tproxy {
            TproxyMode::Off => stream.local_addr().ok(),
            mode => match self.applier.original_destination(&stream, mode) {
                Ok(original) => Some(original),
                Err(e) => {
                    debug!("No original destination for {}: {}", remote, e);
                    stream.local_addr().ok()
                }
            },
        };
        Ok(Box::new(RawConnection::new(stream).with_addrs(local, Some(remote))))
    }

    async fn upgrade(&self, conn: BoxedConnection) -> Result<BoxedConnection> {
        let conn = match &self.acceptor {
            Some(acceptor) => tls::accept(acceptor, conn).await?,
            None => conn,
        };
        Ok(self.authenticator.server(conn))
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(Address::Socket(self.local_addr))
    }

    async fn close(&self) -> Result<()> {
        self.listener.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_json() {
        let settings: TcpSettings = serde_json::from_value(serde_json::json!({
            "header": {
                "type": "http",
                "request": { "path": ["/video"] }
            }
        }))
        .unwrap();
        assert_eq!(settings.header.kind, "http");
        assert!(settings.header.settings.contains_key("request"));

        let registry = Registry::builtin().unwrap();
        assert!(settings.header.authenticator(&registry).is_ok());
    }

    #[test]
    fn test_default_header_is_none() {
        let settings = TcpSettings::default();
        assert_eq!(settings.header.kind, "none");
        let registry = Registry::builtin().unwrap();
        assert!(settings.header.authenticator(&registry).is_ok());
    }

    #[test]
    fn test_unknown_header_type() {
        let settings: TcpSettings = serde_json::from_value(serde_json::json!({
            "header": { "type": "ftp" }
        }))
        .unwrap();
        let registry = Registry::builtin().unwrap();
        assert!(matches!(
            settings.header.authenticator(&registry),
            Err(Error::NotRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_stops_accepting() {
        let ctx = TransportContext::new(Registry::builtin().unwrap());
        let stream = ctx.resolve(&Default::default()).unwrap();
        let listener = TcpBinder
            .bind(&ctx, &"127.0.0.1:0".parse().unwrap(), &stream)
            .await
            .unwrap();
        listener.close().await.unwrap();
        assert!(matches!(listener.accept().await, Err(Error::ConnectionClosed)));
    }
}
