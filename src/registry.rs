//! Protocol registry
//!
//! Name-keyed tables of everything pluggable: transport settings factories,
//! dialers, listeners, packet headers, packet authenticators and connection
//! authenticators. A registry is assembled with `RegistryBuilder` and frozen;
//! afterwards it is read-only and shared through an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use tracing::debug;

use crate::auth::{self, Authenticator};
use crate::error::{Error, Result};
use crate::header::{self, ConnectionAuthenticator, PacketHeader};
use crate::transport::{self, TransportBinder, TransportDialer, TransportSettings};

/// Builds the settings for a carrier; `None` yields its zero value
pub type TransportConfigFactory = fn(Option<&serde_json::Value>) -> Result<Arc<dyn TransportSettings>>;
pub type HeaderFactory = fn() -> Box<dyn PacketHeader>;
/// Takes the key seed; keyless authenticators ignore it
pub type AuthenticatorFactory = fn(&str) -> Result<Box<dyn Authenticator>>;
pub type ConnectionAuthenticatorFactory = fn(&serde_json::Value) -> Result<Arc<dyn ConnectionAuthenticator>>;

lazy_static! {
    static ref GLOBAL: Arc<Registry> = Registry::builtin().expect("built-in registrations are unique");
}

/// Frozen protocol registry
#[derive(Default)]
pub struct Registry {
    transports: HashMap<String, TransportConfigFactory>,
    dialers: HashMap<String, Arc<dyn TransportDialer>>,
    listeners: HashMap<String, Arc<dyn TransportBinder>>,
    headers: HashMap<String, HeaderFactory>,
    authenticators: HashMap<String, AuthenticatorFactory>,
    connection_authenticators: HashMap<String, ConnectionAuthenticatorFactory>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// A fresh registry holding every built-in carrier, header and authenticator
    pub fn builtin() -> Result<Arc<Registry>> {
        let mut builder = Self::builder();
        transport::register_builtin(&mut builder)?;
        header::register_builtin(&mut builder)?;
        auth::register_builtin(&mut builder)?;
        Ok(builder.build())
    }

    /// Process-wide default registry, built on first use
    pub fn global() -> Arc<Registry> {
        GLOBAL.clone()
    }

    pub fn create_transport_config(&self, name: &str) -> Result<Arc<dyn TransportSettings>> {
        let factory = self.transports.get(name).ok_or_else(|| Error::not_found("transport", name))?;
        factory(None)
    }

    pub fn create_transport_config_from(&self, name: &str, json: &serde_json::Value) -> Result<Arc<dyn TransportSettings>> {
        let factory = self.transports.get(name).ok_or_else(|| Error::not_found("transport", name))?;
        factory(Some(json))
    }

    pub fn has_transport(&self, name: &str) -> bool {
        self.transports.contains_key(name)
    }

    pub fn dialer(&self, name: &str) -> Result<Arc<dyn TransportDialer>> {
        self.dialers.get(name).cloned().ok_or_else(|| Error::not_registered("dialer", name))
    }

    pub fn listener(&self, name: &str) -> Result<Arc<dyn TransportBinder>> {
        self.listeners.get(name).cloned().ok_or_else(|| Error::not_registered("listener", name))
    }

    pub fn create_header(&self, name: &str) -> Result<Box<dyn PacketHeader>> {
        let factory = self.headers.get(name).ok_or_else(|| Error::not_registered("header", name))?;
        Ok(factory())
    }

    pub fn create_authenticator(&self, name: &str, seed: &str) -> Result<Box<dyn Authenticator>> {
        let factory = self.authenticators.get(name).ok_or_else(|| Error::not_registered("authenticator", name))?;
        factory(seed)
    }

    pub fn create_connection_authenticator(
        &self,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<Arc<dyn ConnectionAuthenticator>> {
        let factory = self
            .connection_authenticators
            .get(name)
            .ok_or_else(|| Error::not_registered("connection authenticator", name))?;
        factory(config)
    }
}

/// Mutable registry under construction
///
/// Every `register_*` fails with `Error::DuplicateRegistration` when the
/// name is taken, keeping the first entry.
#[derive(Default)]
pub struct RegistryBuilder {
    inner: Registry,
}

fn insert_unique<V>(table: &mut HashMap<String, V>, kind: &'static str, name: &str, value: V) -> Result<()> {
    if table.contains_key(name) {
        return Err(Error::duplicate(kind, name));
    }
    debug!("Registered {} '{}'", kind, name);
    table.insert(name.to_string(), value);
    Ok(())
}

impl RegistryBuilder {
    pub fn register_transport(&mut self, name: &str, factory: TransportConfigFactory) -> Result<()> {
        insert_unique(&mut self.inner.transports, "transport", name, factory)
    }

    pub fn register_dialer(&mut self, name: &str, dialer: Arc<dyn TransportDialer>) -> Result<()> {
        insert_unique(&mut self.inner.dialers, "dialer", name, dialer)
    }

    pub fn register_listener(&mut self, name: &str, listener: Arc<dyn TransportBinder>) -> Result<()> {
        insert_unique(&mut self.inner.listeners, "listener", name, listener)
    }

    pub fn register_header(&mut self, name: &str, factory: HeaderFactory) -> Result<()> {
        insert_unique(&mut self.inner.headers, "header", name, factory)
    }

    pub fn register_authenticator(&mut self, name: &str, factory: AuthenticatorFactory) -> Result<()> {
        insert_unique(&mut self.inner.authenticators, "authenticator", name, factory)
    }

    pub fn register_connection_authenticator(&mut self, name: &str, factory: ConnectionAuthenticatorFactory) -> Result<()> {
        insert_unique(&mut self.inner.connection_authenticators, "connection authenticator", name, factory)
    }

    pub fn build(self) -> Arc<Registry> {
        Arc::new(self.inner)
    }
}
