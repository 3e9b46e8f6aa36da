//! Destination - network family plus endpoint

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Address;
use crate::error::{Error, Result};

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Immutable dial/listen target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub network: Network,
    pub address: Address,
}

impl Destination {
    pub fn tcp(address: impl Into<Address>) -> Self {
        Self {
            network: Network::Tcp,
            address: address.into(),
        }
    }

    pub fn udp(address: impl Into<Address>) -> Self {
        Self {
            network: Network::Udp,
            address: address.into(),
        }
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}

impl FromStr for Destination {
    type Err = Error;

    /// Parse `tcp:host:port`, `udp:host:port` or bare `host:port` (TCP)
    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("tcp:") {
            return Ok(Destination::tcp(rest.parse::<Address>()?));
        }
        if let Some(rest) = s.strip_prefix("udp:") {
            return Ok(Destination::udp(rest.parse::<Address>()?));
        }
        Ok(Destination::tcp(s.parse::<Address>()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_key() {
        let d = Destination::tcp(Address::domain("example.com", 80));
        assert_eq!(d.to_string(), "tcp:example.com:80");

        let parsed: Destination = "udp:1.1.1.1:53".parse().unwrap();
        assert_eq!(parsed.network, Network::Udp);
        assert_eq!(parsed.port(), 53);
        assert_eq!(parsed.to_string(), "udp:1.1.1.1:53");
    }
}
