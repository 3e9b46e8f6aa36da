//! Configuration module
//!
//! JSON configuration in V2Ray shape: a root `transport` block with global
//! per-carrier defaults, inbounds that listen with their own stream
//! settings, and outbounds the inbounds forward to.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::common::{Address, Destination, Network};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::transport::sockopt::SocketConfig;
use crate::transport::{SecuritySettings, StreamSettings, TlsSettings, TransportConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    /// Global carrier defaults, used where a stream has no settings of its own
    #[serde(default)]
    pub transport: TransportBlock,

    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,

    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross references and addresses
    pub fn validate(&self) -> Result<()> {
        for inbound in &self.inbounds {
            inbound.listen_address()?;
            if self.outbound(&inbound.forward).is_none() {
                return Err(Error::Config(format!(
                    "inbound '{}' forwards to unknown outbound '{}'",
                    inbound.tag, inbound.forward
                )));
            }
        }
        for outbound in &self.outbounds {
            outbound.destination()?;
        }
        Ok(())
    }

    pub fn outbound(&self, tag: &str) -> Option<&OutboundConfig> {
        self.outbounds.iter().find(|o| o.tag == tag)
    }

    /// Global carrier settings decoded through `registry`
    pub fn global_transport(&self, registry: &Registry) -> Result<Vec<TransportConfig>> {
        self.transport.build(registry)
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Per-carrier settings blobs, decoded by each carrier's registered factory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_settings: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kcp_settings: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_settings: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ds_settings: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quic_settings: Option<serde_json::Value>,
}

impl TransportBlock {
    pub fn build(&self, registry: &Registry) -> Result<Vec<TransportConfig>> {
        let blocks = [
            ("tcp", &self.tcp_settings),
            ("websocket", &self.ws_settings),
            ("mkcp", &self.kcp_settings),
            ("http", &self.http_settings),
            ("domainsocket", &self.ds_settings),
            ("quic", &self.quic_settings),
        ];

        let mut configs = Vec::new();
        for (protocol, block) in blocks {
            if let Some(json) = block {
                let settings = registry.create_transport_config_from(protocol, json)?;
                configs.push(TransportConfig::new(protocol, settings));
            }
        }
        Ok(configs)
    }
}

/// Registry name of a carrier, accepting the usual V2Ray aliases
pub fn canonical_protocol(network: &str) -> &str {
    match network {
        "" => "tcp",
        "ws" => "websocket",
        "kcp" => "mkcp",
        "h2" => "http",
        other => other,
    }
}

/// `streamSettings` of an inbound or outbound
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    pub network: String,
    pub security: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(flatten)]
    pub transport: TransportBlock,
    pub sockopt: SocketConfig,
}

impl StreamConfig {
    pub fn build(&self, registry: &Registry) -> Result<StreamSettings> {
        let protocol = canonical_protocol(&self.network).to_string();
        if !registry.has_transport(&protocol) {
            return Err(Error::not_found("transport", protocol));
        }

        let security_type = match self.security.to_ascii_lowercase().as_str() {
            "" | "none" => String::new(),
            other => other.to_string(),
        };
        let security_settings = self
            .tls_settings
            .iter()
            .cloned()
            .map(SecuritySettings::Tls)
            .collect();

        Ok(StreamSettings {
            protocol,
            transport_settings: self.transport.build(registry)?,
            security_type,
            security_settings,
            socket: self.sockopt.clone(),
        })
    }
}

/// Inbound configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundConfig {
    /// Unique tag for this inbound
    pub tag: String,

    /// Listen address, e.g. `0.0.0.0:1080`
    pub listen: String,

    #[serde(default)]
    pub stream_settings: StreamConfig,

    /// Tag of the outbound accepted connections are forwarded to
    pub forward: String,
}

impl InboundConfig {
    pub fn listen_address(&self) -> Result<Address> {
        self.listen.parse()
    }
}

/// Outbound configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundConfig {
    /// Unique tag for this outbound
    pub tag: String,

    /// Target `host:port`
    pub address: String,

    #[serde(default)]
    pub network: Network,

    #[serde(default)]
    pub stream_settings: StreamConfig,
}

impl OutboundConfig {
    pub fn destination(&self) -> Result<Destination> {
        let address: Address = self.address.parse()?;
        Ok(Destination {
            network: self.network,
            address,
        })
    }
}
