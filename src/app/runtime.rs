//! Tunnel runtime
//!
//! Every inbound gets a hub; every connection a hub accepts is dialed out
//! through the inbound's forward outbound and relayed until both sides
//! finish or the relay goes idle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::common::relay::relay;
use crate::common::{Address, Destination};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::transport::{BoxedConnection, ConnHandler, DialerOptions, Hub, StreamSettings, TransportContext};

/// Relays with no traffic for this long are torn down
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Where an inbound's connections go
struct ForwardTarget {
    tag: String,
    dest: Destination,
    stream: StreamSettings,
}

struct InboundPlan {
    tag: String,
    listen: Address,
    stream: StreamSettings,
    forward: Arc<ForwardTarget>,
}

/// Dials the forward outbound for each accepted connection and relays
struct ForwardHandler {
    ctx: Arc<TransportContext>,
    inbound: String,
    target: Arc<ForwardTarget>,
    idle_timeout: Duration,
}

#[async_trait]
impl ConnHandler for ForwardHandler {
    async fn handle(&self, conn: BoxedConnection) {
        let source = conn.remote_addr();
        let outbound = match self
            .ctx
            .dial(None, &self.target.dest, &self.target.stream, &DialerOptions::default())
            .await
        {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!(
                    "[{}] Failed to reach {} via '{}': {}",
                    self.inbound, self.target.dest, self.target.tag, e
                );
                return;
            }
        };

        debug!("[{}] {:?} -> {} via '{}'", self.inbound, source, self.target.dest, self.target.tag);
        let stats = relay(conn, outbound, self.idle_timeout).await;
        debug!(
            "[{}] {:?} done: {} bytes up, {} bytes down",
            self.inbound, source, stats.uploaded, stats.downloaded
        );
    }
}

/// Runtime built from a validated configuration
pub struct Runtime {
    ctx: Arc<TransportContext>,
    inbounds: Vec<InboundPlan>,
    idle_timeout: Duration,
}

impl Runtime {
    /// Build against the process-wide registry
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_registry(config, Registry::global())
    }

    pub fn with_registry(config: &Config, registry: Arc<Registry>) -> Result<Self> {
        let global = config.global_transport(&registry)?;

        let mut inbounds = Vec::with_capacity(config.inbounds.len());
        for inbound in &config.inbounds {
            let outbound = config.outbound(&inbound.forward).ok_or_else(|| {
                Error::Config(format!("inbound '{}' forwards to unknown outbound '{}'", inbound.tag, inbound.forward))
            })?;
            let forward = Arc::new(ForwardTarget {
                tag: outbound.tag.clone(),
                dest: outbound.destination()?,
                stream: outbound.stream_settings.build(&registry)?,
            });
            inbounds.push(InboundPlan {
                tag: inbound.tag.clone(),
                listen: inbound.listen_address()?,
                stream: inbound.stream_settings.build(&registry)?,
                forward,
            });
        }

        let ctx = TransportContext::new(registry).with_global_settings(global, Vec::new());
        Ok(Self {
            ctx: Arc::new(ctx),
            inbounds,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn context(&self) -> &Arc<TransportContext> {
        &self.ctx
    }

    /// Open every inbound. Already opened hubs are closed if one fails.
    pub async fn start(&self) -> Result<Vec<Hub>> {
        let mut hubs = Vec::with_capacity(self.inbounds.len());
        for inbound in &self.inbounds {
            let handler = Arc::new(ForwardHandler {
                ctx: self.ctx.clone(),
                inbound: inbound.tag.clone(),
                target: inbound.forward.clone(),
                idle_timeout: self.idle_timeout,
            });

            match self.ctx.listen(&inbound.listen, &inbound.stream, handler).await {
                Ok(hub) => {
                    info!(
                        "[{}] Listening on {} ({}), forwarding to '{}'",
                        inbound.tag,
                        hub.local_addr(),
                        inbound.stream.effective_protocol(),
                        inbound.forward.tag
                    );
                    hubs.push(hub);
                }
                Err(e) => {
                    for hub in &hubs {
                        let _ = hub.close().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(hubs)
    }

    /// Run until Ctrl+C
    pub async fn run(&self) -> Result<()> {
        let hubs = self.start().await?;
        info!("Runtime started with {} inbounds", hubs.len());

        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");

        for hub in &hubs {
            if let Err(e) = hub.close().await {
                warn!("Failed to close listener on {}: {}", hub.local_addr(), e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_tunnel_forwards_to_outbound() {
        let echo = echo_server().await;
        let json = format!(
            r#"{{
                "inbounds": [{{ "tag": "in", "listen": "127.0.0.1:0", "forward": "echo" }}],
                "outbounds": [{{ "tag": "echo", "address": "{}" }}]
            }}"#,
            echo
        );
        let config = Config::from_json(&json).unwrap();
        let runtime = Runtime::with_registry(&config, Registry::builtin().unwrap()).unwrap();
        let hubs = runtime.start().await.unwrap();
        assert_eq!(hubs.len(), 1);

        let addr = hubs[0].local_addr().as_socket().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"through the tunnel").await.unwrap();
        let mut buf = [0u8; 18];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the tunnel");

        hubs[0].close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unlistenable_carrier_fails_start() {
        let json = r#"{
            "inbounds": [{
                "tag": "in",
                "listen": "127.0.0.1:0",
                "streamSettings": { "network": "kcp" },
                "forward": "out"
            }],
            "outbounds": [{ "tag": "out", "address": "127.0.0.1:9" }]
        }"#;
        let config = Config::from_json(json).unwrap();
        let runtime = Runtime::with_registry(&config, Registry::builtin().unwrap()).unwrap();
        assert!(matches!(runtime.start().await, Err(Error::NotRegistered { .. })));
    }
}
