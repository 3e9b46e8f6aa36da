//! Dialer façade
//!
//! `TransportContext` is the one entry point proxies use to reach the
//! network. It owns the registry, the global per-carrier defaults and the
//! two replaceable hooks: a proxy dialer for chained outbounds and the
//! system dialer for raw sockets.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::carriers::{KcpSettings, QuicSettings};
use super::hub::{AcceptBackoff, ConnHandler, Hub};
use super::packet::ObfuscatedPacketConn;
use super::sockopt::{platform_applier, SocketConfig, SocketOptionApplier};
use super::system::{self, DefaultSystemDialer, SystemDialer};
use super::{BoxedConnection, ResolvedStream, SecuritySettings, StreamSettings, TransportConfig};
use crate::auth::AuthenticatorChain;
use crate::common::{Address, Destination, Network};
use crate::error::{Error, Result};
use crate::registry::Registry;

/// Dials through another outbound, identified by tag
#[async_trait]
pub trait ProxyDialer: Send + Sync {
    async fn dial(&self, tag: &str, src: Option<&Address>, dest: &Destination) -> Result<BoxedConnection>;
}

/// Per-dial options
#[derive(Debug, Clone, Default)]
pub struct DialerOptions {
    /// Route the connection through the outbound with this tag
    pub proxy: Option<String>,
}

/// Shared transport state
pub struct TransportContext {
    registry: Arc<Registry>,
    global_transport: Vec<TransportConfig>,
    global_security: Vec<SecuritySettings>,
    applier: Arc<dyn SocketOptionApplier>,
    proxy_dialer: RwLock<Option<Arc<dyn ProxyDialer>>>,
    system_dialer: RwLock<Option<Arc<dyn SystemDialer>>>,
    default_system_dialer: Arc<DefaultSystemDialer>,
    accept_backoff: AcceptBackoff,
}

impl TransportContext {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_applier(registry, platform_applier())
    }

    pub fn with_applier(registry: Arc<Registry>, applier: Arc<dyn SocketOptionApplier>) -> Self {
        Self {
            registry,
            global_transport: Vec::new(),
            global_security: Vec::new(),
            default_system_dialer: Arc::new(DefaultSystemDialer::new(applier.clone())),
            applier,
            proxy_dialer: RwLock::new(None),
            system_dialer: RwLock::new(None),
            accept_backoff: AcceptBackoff::default(),
        }
    }

    /// Global defaults consulted when a stream does not carry its own settings
    pub fn with_global_settings(mut self, transport: Vec<TransportConfig>, security: Vec<SecuritySettings>) -> Self {
        self.global_transport = transport;
        self.global_security = security;
        self
    }

    pub fn with_accept_backoff(mut self, backoff: AcceptBackoff) -> Self {
        self.accept_backoff = backoff;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn applier(&self) -> &Arc<dyn SocketOptionApplier> {
        &self.applier
    }

    pub fn set_proxy_dialer(&self, dialer: Option<Arc<dyn ProxyDialer>>) {
        *self.proxy_dialer.write() = dialer;
    }

    /// Install an alternative system dialer; `None` restores the default
    pub fn set_system_dialer(&self, dialer: Option<Arc<dyn SystemDialer>>) {
        *self.system_dialer.write() = dialer;
    }

    pub fn resolve(&self, stream: &StreamSettings) -> Result<ResolvedStream> {
        stream.resolve(&self.registry, &self.global_transport, &self.global_security)
    }

    /// Open a connection to `dest` according to `stream`
    pub async fn dial(
        &self,
        src: Option<&Address>,
        dest: &Destination,
        stream: &StreamSettings,
        options: &DialerOptions,
    ) -> Result<BoxedConnection> {
        if let Some(tag) = options.proxy.as_deref() {
            let proxy = self.proxy_dialer.read().clone();
            match proxy {
                Some(proxy) => {
                    debug!("Dialing {} through proxy '{}'", dest, tag);
                    return proxy.dial(tag, src, dest).await;
                }
                None => debug!("Proxy '{}' requested but no proxy dialer installed", tag),
            }
        }

        let protocol = match dest.network {
            Network::Tcp => stream.effective_protocol(),
            Network::Udp => "udp",
        };
        let dialer = self.registry.dialer(protocol)?;
        let resolved = self.resolve(stream)?;

        debug!("Dialing {} over {}", dest, protocol);
        dialer.dial(self, src, dest, &resolved).await
    }

    /// Create, tune and connect an OS socket
    pub async fn dial_system(&self, src: Option<&Address>, dest: &Destination, sockopt: &SocketConfig) -> Result<BoxedConnection> {
        let installed = self.system_dialer.read().clone();
        match installed {
            Some(dialer) => dialer.dial(src, dest, sockopt).await,
            None => self.default_system_dialer.dial(src, dest, sockopt).await,
        }
    }

    /// Bind an OS TCP listener with inbound socket options applied
    pub async fn listen_system_tcp(&self, addr: &Address, sockopt: &SocketConfig) -> Result<tokio::net::TcpListener> {
        let addr: SocketAddr = addr.resolve().await?;
        system::listen_tcp(addr, sockopt, self.applier.as_ref())
    }

    /// Bind a UDP socket for a packet-based carrier (`mkcp`, `quic`) and wrap
    /// it in that carrier's header and authenticator pipeline
    pub async fn listen_packet(&self, addr: &Address, stream: &StreamSettings) -> Result<ObfuscatedPacketConn> {
        let resolved = self.resolve(stream)?;
        let pipeline = self.packet_pipeline(&resolved)?;
        let addr: SocketAddr = addr.resolve().await?;
        let socket = system::listen_udp(addr, &resolved.socket, self.applier.as_ref())?;
        debug!("Packet socket for {} bound on {}", resolved.protocol, addr);
        Ok(ObfuscatedPacketConn::new(socket, Arc::new(pipeline)))
    }

    fn packet_pipeline(&self, resolved: &ResolvedStream) -> Result<AuthenticatorChain> {
        match resolved.protocol.as_str() {
            "mkcp" => resolved.settings::<KcpSettings>()?.packet_pipeline(&self.registry),
            "quic" => resolved.settings::<QuicSettings>()?.packet_pipeline(&self.registry),
            other => Err(Error::Unsupported(format!("{} is not a packet carrier", other))),
        }
    }

    /// Bind a listener for `stream` on `addr` and start accepting into `handler`
    pub async fn listen(&self, addr: &Address, stream: &StreamSettings, handler: Arc<dyn ConnHandler>) -> Result<Hub> {
        let resolved = self.resolve(stream)?;
        let binder = self.registry.listener(&resolved.protocol)?;
        let listener = binder.bind(self, addr, &resolved).await?;
        Hub::start(listener, handler, self.accept_backoff.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RawConnection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingDialer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProxyDialer for RecordingDialer {
        async fn dial(&self, _tag: &str, _src: Option<&Address>, _dest: &Destination) -> Result<BoxedConnection> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (a, _b) = tokio::io::duplex(16);
            Ok(Box::new(RawConnection::new(a)))
        }
    }

    #[async_trait]
    impl SystemDialer for RecordingDialer {
        async fn dial(&self, _src: Option<&Address>, _dest: &Destination, _sockopt: &SocketConfig) -> Result<BoxedConnection> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (a, _b) = tokio::io::duplex(16);
            Ok(Box::new(RawConnection::new(a)))
        }
    }

    fn context() -> TransportContext {
        TransportContext::new(Registry::builtin().unwrap())
    }

    fn unreachable_dest() -> Destination {
        Destination::tcp(Address::domain("example.invalid", 80))
    }

    #[tokio::test]
    async fn test_unregistered_protocol_fails_before_dialing() {
        let ctx = context();
        let recorder = Arc::new(RecordingDialer { calls: AtomicUsize::new(0) });
        ctx.set_system_dialer(Some(recorder.clone()));

        let stream = StreamSettings::with_protocol("mkcp");
        let Err(err) = ctx.dial(None, &unreachable_dest(), &stream, &DialerOptions::default()).await else {
            panic!("mkcp has no dialer");
        };
        assert!(matches!(err, Error::NotRegistered { kind: "dialer", .. }));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
    }

    fn kcp_stream(ctx: &TransportContext, seed: &str) -> StreamSettings {
        let settings = ctx
            .registry()
            .create_transport_config_from("mkcp", &serde_json::json!({ "header": { "type": "wechat-video" }, "seed": seed }))
            .unwrap();
        let mut stream = StreamSettings::with_protocol("mkcp");
        stream.transport_settings.push(TransportConfig::new("mkcp", settings));
        stream
    }

    #[tokio::test]
    async fn test_packet_sockets_share_carrier_pipeline() {
        let ctx = context();
        let local: Address = "127.0.0.1:0".parse().unwrap();
        let a = ctx.listen_packet(&local, &kcp_stream(&ctx, "kcp-seed")).await.unwrap();
        let b = ctx.listen_packet(&local, &kcp_stream(&ctx, "kcp-seed")).await.unwrap();
        let stranger = ctx.listen_packet(&local, &kcp_stream(&ctx, "other-seed")).await.unwrap();
        assert_eq!(a.max_payload(), 65535 - 13 - 28);

        stranger.send_to(b"wrong key", b.local_addr().unwrap()).await.unwrap();
        a.send_to(b"segment", b.local_addr().unwrap()).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"segment");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_stream_carrier_has_no_packet_socket() {
        let ctx = context();
        let local: Address = "127.0.0.1:0".parse().unwrap();
        let Err(err) = ctx.listen_packet(&local, &StreamSettings::default()).await else {
            panic!("tcp bound a packet socket");
        };
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_proxy_dialer_takes_precedence() {
        let ctx = context();
        let proxy = Arc::new(RecordingDialer { calls: AtomicUsize::new(0) });
        ctx.set_proxy_dialer(Some(proxy.clone()));

        let options = DialerOptions { proxy: Some("upstream".into()) };
        // Even an unregistered carrier is fine: the proxy dialer owns the dial
        let stream = StreamSettings::with_protocol("mkcp");
        ctx.dial(None, &unreachable_dest(), &stream, &options).await.unwrap();
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_udp_always_uses_udp_dialer() {
        let ctx = context();
        let recorder = Arc::new(RecordingDialer { calls: AtomicUsize::new(0) });
        ctx.set_system_dialer(Some(recorder.clone()));

        // websocket would need a handshake; udp goes straight to the system dialer
        let stream = StreamSettings::with_protocol("websocket");
        let dest = Destination::udp(Address::domain("example.invalid", 53));
        ctx.dial(None, &dest, &stream, &DialerOptions::default()).await.unwrap();
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_system_dialer_reset() {
        let ctx = context();
        let recorder = Arc::new(RecordingDialer { calls: AtomicUsize::new(0) });
        ctx.set_system_dialer(Some(recorder.clone()));
        ctx.dial_system(None, &unreachable_dest(), &SocketConfig::default()).await.unwrap();
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);

        ctx.set_system_dialer(None);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest = Destination::tcp(listener.local_addr().unwrap());
        ctx.dial_system(None, &dest, &SocketConfig::default()).await.unwrap();
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    }
}
