//! Settings of carriers whose engines are not part of this crate
//!
//! mKCP, HTTP/2 and QUIC register only their settings here so streams that
//! name them resolve; dialing them fails with `NotRegistered` until an
//! engine registers a dialer. The packet-based ones expose the obfuscation
//! pipeline their engine wraps around its UDP socket.

use serde::{Deserialize, Serialize};

use super::TransportSettings;
use crate::auth::{AuthenticatorChain, PacketPipeline};
use crate::error::Result;
use crate::registry::Registry;

/// `header` block of packet-based carriers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketHeaderSettings {
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for PacketHeaderSettings {
    fn default() -> Self {
        Self { kind: "none".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KcpSettings {
    pub mtu: u32,
    pub tti: u32,
    pub uplink_capacity: u32,
    pub downlink_capacity: u32,
    pub congestion: bool,
    pub read_buffer_size: u32,
    pub write_buffer_size: u32,
    pub header: PacketHeaderSettings,
    /// Obfuscation key; empty selects the keyless `simple` authenticator
    pub seed: String,
}

impl Default for KcpSettings {
    fn default() -> Self {
        Self {
            mtu: 1350,
            tti: 50,
            uplink_capacity: 5,
            downlink_capacity: 20,
            congestion: false,
            read_buffer_size: 2,
            write_buffer_size: 2,
            header: PacketHeaderSettings::default(),
            seed: String::new(),
        }
    }
}

impl KcpSettings {
    pub fn packet_pipeline(&self, registry: &Registry) -> Result<AuthenticatorChain> {
        let security = if self.seed.is_empty() { "simple" } else { "aes-128-gcm" };
        PacketPipeline::build(registry, &self.header.kind, security, &self.seed)
    }
}

impl TransportSettings for KcpSettings {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSettings {
    /// Candidate Host values, one picked per request
    pub host: Vec<String>,
    pub path: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: Vec::new(),
            path: "/".into(),
        }
    }
}

impl TransportSettings for HttpSettings {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuicSettings {
    /// Packet authenticator name: `none`, `aes-128-gcm` or `chacha20-poly1305`
    pub security: String,
    pub key: String,
    pub header: PacketHeaderSettings,
}

impl Default for QuicSettings {
    fn default() -> Self {
        Self {
            security: "none".into(),
            key: String::new(),
            header: PacketHeaderSettings::default(),
        }
    }
}

impl QuicSettings {
    pub fn packet_pipeline(&self, registry: &Registry) -> Result<AuthenticatorChain> {
        PacketPipeline::build(registry, &self.header.kind, &self.security, &self.key)
    }
}

impl TransportSettings for QuicSettings {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;

    #[test]
    fn test_kcp_pipeline() {
        let registry = Registry::builtin().unwrap();

        let keyless = KcpSettings::default().packet_pipeline(&registry).unwrap();
        assert_eq!(keyless.overhead(), 6);

        let settings: KcpSettings = serde_json::from_value(serde_json::json!({
            "mtu": 1200,
            "header": { "type": "wechat-video" },
            "seed": "kcp-seed"
        }))
        .unwrap();
        assert_eq!(settings.mtu, 1200);
        assert_eq!(settings.tti, 50);
        assert_eq!(settings.packet_pipeline(&registry).unwrap().overhead(), 13 + 28);
    }

    #[test]
    fn test_quic_pipeline() {
        let registry = Registry::builtin().unwrap();
        assert_eq!(QuicSettings::default().packet_pipeline(&registry).unwrap().overhead(), 0);

        let settings = QuicSettings {
            security: "chacha20-poly1305".into(),
            key: "quic-key".into(),
            header: PacketHeaderSettings { kind: "srtp".into() },
        };
        assert_eq!(settings.packet_pipeline(&registry).unwrap().overhead(), 4 + 28);

        let keyless = QuicSettings {
            security: "aes-128-gcm".into(),
            ..Default::default()
        };
        assert!(keyless.packet_pipeline(&registry).is_err());
    }

    #[test]
    fn test_http_defaults() {
        let settings: HttpSettings = serde_json::from_value(serde_json::json!({ "host": ["a.example"] })).unwrap();
        assert_eq!(settings.path, "/");
        assert_eq!(settings.host, vec!["a.example".to_string()]);
    }
}
