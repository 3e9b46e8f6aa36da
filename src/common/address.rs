//! Address type for network endpoints

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create an unspecified address (0.0.0.0:0)
    pub fn unspecified() -> Self {
        Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Create from IP and port
    pub fn ip_port(ip: IpAddr, port: u16) -> Self {
        Address::Socket(SocketAddr::new(ip, port))
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Try to get as socket address (fails for domain)
    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Address::Socket(addr) => Some(*addr),
            Address::Domain(_, _) => None,
        }
    }

    /// Resolve to a socket address, looking the domain up if needed.
    /// The first address returned by the resolver wins.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            Address::Socket(addr) => Ok(*addr),
            Address::Domain(domain, port) => tokio::net::lookup_host((domain.as_str(), *port))
                .await?
                .next()
                .ok_or_else(|| Error::InvalidAddress(format!("{} did not resolve", self))),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Parse `ip:port`, `[ipv6]:port` or `host:port`
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse() {
            return Ok(Address::Socket(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("invalid port in {}", s)))?;
        if host.is_empty() {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        if let Ok(ip) = host.parse() {
            return Ok(Address::ip_port(ip, port));
        }
        Ok(Address::Domain(host.to_string(), port))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl From<(&str, u16)> for Address {
    fn from((domain, port): (&str, u16)) -> Self {
        Address::Domain(domain.to_string(), port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let a: Address = "127.0.0.1:80".parse().unwrap();
        assert_eq!(a, Address::Socket("127.0.0.1:80".parse().unwrap()));

        let b: Address = "example.com:443".parse().unwrap();
        assert_eq!(b, Address::domain("example.com", 443));
        assert_eq!(b.to_string(), "example.com:443");

        assert!("example.com".parse::<Address>().is_err());
        assert!(":80".parse::<Address>().is_err());
    }

    #[tokio::test]
    async fn test_resolve_socket_address() {
        let a: Address = "10.0.0.1:53".parse().unwrap();
        assert_eq!(a.resolve().await.unwrap(), "10.0.0.1:53".parse().unwrap());
    }
}
