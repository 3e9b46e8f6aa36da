//! Common types and abstractions
//!
//! - Address / Destination: endpoint model shared by every layer
//! - relay: bidirectional copy used by the tunnel binary

mod address;
mod destination;
pub mod relay;

pub use address::Address;
pub use destination::{Destination, Network};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
