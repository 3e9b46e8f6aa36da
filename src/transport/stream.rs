//! Stream settings and their resolution
//!
//! A `StreamSettings` is what one inbound or outbound declares: carrier
//! name, per-carrier settings, security layer and socket tuning. Before a
//! dial or listen it is resolved against the context's global defaults and
//! the registry into a `ResolvedStream` holding exactly one settings object
//! per concern.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::sockopt::SocketConfig;
use super::tls::TlsSettings;
use super::TransportSettings;
use crate::error::{Error, Result};
use crate::registry::Registry;

/// Carrier used when a stream names none
pub const DEFAULT_PROTOCOL: &str = "tcp";

/// Settings for one named carrier
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub protocol: String,
    pub settings: Arc<dyn TransportSettings>,
}

impl TransportConfig {
    pub fn new(protocol: impl Into<String>, settings: Arc<dyn TransportSettings>) -> Self {
        Self {
            protocol: protocol.into(),
            settings,
        }
    }
}

/// Security layer settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecuritySettings {
    Tls(TlsSettings),
}

impl SecuritySettings {
    pub fn kind(&self) -> &'static str {
        match self {
            SecuritySettings::Tls(_) => "tls",
        }
    }

    /// Zero-value settings for a security type
    pub fn default_for(kind: &str) -> Result<Self> {
        match kind {
            "tls" => Ok(SecuritySettings::Tls(TlsSettings::default())),
            other => Err(Error::not_registered("security", other)),
        }
    }
}

/// Declared stream settings of one inbound/outbound
#[derive(Debug, Clone, Default)]
pub struct StreamSettings {
    /// Carrier name; empty means `tcp`
    pub protocol: String,
    pub transport_settings: Vec<TransportConfig>,
    /// Security type; empty (or `none`) means no security layer
    pub security_type: String,
    pub security_settings: Vec<SecuritySettings>,
    pub socket: SocketConfig,
}

impl StreamSettings {
    pub fn with_protocol(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            ..Default::default()
        }
    }

    pub fn effective_protocol(&self) -> &str {
        if self.protocol.is_empty() {
            DEFAULT_PROTOCOL
        } else {
            &self.protocol
        }
    }

    /// Local entry, then the global default, then the registry's zero value
    pub fn resolve_transport_settings(
        &self,
        protocol: &str,
        registry: &Registry,
        global: &[TransportConfig],
    ) -> Result<Arc<dyn TransportSettings>> {
        if let Some(config) = self.transport_settings.iter().find(|c| c.protocol == protocol) {
            return Ok(config.settings.clone());
        }
        if let Some(config) = global.iter().find(|c| c.protocol == protocol) {
            return Ok(config.settings.clone());
        }
        registry.create_transport_config(protocol)
    }

    /// `None` when the stream has no security layer
    pub fn resolve_security_settings(&self, global: &[SecuritySettings]) -> Result<Option<SecuritySettings>> {
        let kind = self.security_type.as_str();
        if kind.is_empty() || kind == "none" {
            return Ok(None);
        }
        if let Some(settings) = self.security_settings.iter().find(|s| s.kind() == kind) {
            return Ok(Some(settings.clone()));
        }
        if let Some(settings) = global.iter().find(|s| s.kind() == kind) {
            return Ok(Some(settings.clone()));
        }
        SecuritySettings::default_for(kind).map(Some)
    }

    pub fn resolve(
        &self,
        registry: &Registry,
        global_transport: &[TransportConfig],
        global_security: &[SecuritySettings],
    ) -> Result<ResolvedStream> {
        let protocol = self.effective_protocol().to_string();
        let transport = self.resolve_transport_settings(&protocol, registry, global_transport)?;
        let security = self.resolve_security_settings(global_security)?;
        Ok(ResolvedStream {
            protocol,
            transport,
            security,
            socket: self.socket.clone(),
        })
    }
}

/// Stream settings with every lookup already done
#[derive(Debug, Clone)]
pub struct ResolvedStream {
    pub protocol: String,
    pub transport: Arc<dyn TransportSettings>,
    pub security: Option<SecuritySettings>,
    pub socket: SocketConfig,
}

impl ResolvedStream {
    /// Downcast the carrier settings
    pub fn settings<T: TransportSettings>(&self) -> Result<&T> {
        self.transport.as_any().downcast_ref::<T>().ok_or_else(|| {
            Error::Config(format!("transport settings of '{}' have an unexpected type", self.protocol))
        })
    }

    pub fn tls(&self) -> Option<&TlsSettings> {
        match &self.security {
            Some(SecuritySettings::Tls(tls)) => Some(tls),
            None => None,
        }
    }

    /// Digest of everything that shapes a connection built from this stream:
    /// carrier, carrier settings, security layer and socket options.
    /// Pooled connections are only handed to dials with an equal fingerprint.
    pub fn fingerprint(&self) -> String {
        let shape = format!(
            "{}|{:?}|{:?}|{:?}",
            self.protocol, self.transport, self.security, self.socket
        );
        let digest = Sha256::digest(shape.as_bytes());
        digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }
}
