//! Netium transport layer
//!
//! Pluggable carriers with per-connection stream settings, packet
//! obfuscation and authentication, connection reuse and socket tuning.
//!
//! ```text
//! StreamSettings ──resolve──▶ ResolvedStream
//!                                  │
//! TransportContext::dial ──▶ Registry ──▶ TransportDialer (tcp/udp/ws/ds)
//!                                  │            │
//!                                  │            ├─ SystemDialer + SocketOptionApplier
//!                                  │            ├─ TLS
//!                                  │            └─ ConnectionAuthenticator (http header)
//! TransportContext::listen ──▶ TransportBinder ──▶ Hub ──▶ ConnHandler
//! ```
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Address, Destination, relay
//! ├── registry.rs      # Name-keyed factories for carriers, headers, authenticators
//! ├── header/          # Packet headers and connection authenticators
//! ├── auth/            # Packet authenticators and the authenticator chain
//! ├── transport/       # Carriers, dialer façade, hub, cache, sockopt
//! ├── config.rs        # JSON configuration
//! └── app/             # Tunnel runtime
//! ```

// Core types
pub mod common;
pub mod error;
pub mod registry;

// Transport layer
pub mod auth;
pub mod header;
pub mod transport;

// Application
pub mod app;
pub mod config;

// Re-exports for convenience
pub use common::{Address, Destination, Network};
pub use config::Config;
pub use error::{Error, Result};
pub use registry::Registry;
pub use transport::{BoxedConnection, Connection, StreamSettings, TransportContext};
