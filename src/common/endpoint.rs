//! Endpoint type for forwarding destinations

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::Error;

/// Destination endpoint representation
///
/// Used as the forwarder's connection-table key and as the
/// resolver's input when the destination is a name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Endpoint {
    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Endpoint::Domain(domain.into(), port)
    }

    /// Create from socket address
    pub fn socket(addr: SocketAddr) -> Self {
        Endpoint::Socket(addr)
    }

    /// Create from IP and port
    pub fn ip_port(ip: IpAddr, port: u16) -> Self {
        Endpoint::Socket(SocketAddr::new(ip, port))
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Endpoint::Socket(addr) => addr.port(),
            Endpoint::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Endpoint::Socket(addr) => addr.ip().to_string(),
            Endpoint::Domain(domain, _) => domain.clone(),
        }
    }

    /// Check if this is a domain endpoint
    pub fn is_domain(&self) -> bool {
        matches!(self, Endpoint::Domain(_, _))
    }

    /// Try to get as socket address (fails for domain)
    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Socket(addr) => Some(*addr),
            Endpoint::Domain(_, _) => None,
        }
    }

    /// Get domain if this is a domain endpoint
    pub fn as_domain(&self) -> Option<(&str, u16)> {
        match self {
            Endpoint::Domain(domain, port) => Some((domain, *port)),
            Endpoint::Socket(_) => None,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Socket(addr) => write!(f, "{}", addr),
            Endpoint::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Socket(addr)
    }
}

impl From<(String, u16)> for Endpoint {
    fn from((domain, port): (String, u16)) -> Self {
        Endpoint::Domain(domain, port)
    }
}

impl From<(&str, u16)> for Endpoint {
    fn from((domain, port): (&str, u16)) -> Self {
        Endpoint::Domain(domain.to_string(), port)
    }
}

impl From<(IpAddr, u16)> for Endpoint {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        Endpoint::Socket(SocketAddr::new(ip, port))
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parse `host:port`; the host may be an IP or a name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Endpoint::Socket(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        Ok(Endpoint::Domain(host.to_string(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_socket_and_domain_forms() {
        assert_eq!(
            "1.2.3.4:80".parse::<Endpoint>().unwrap(),
            Endpoint::ip_port("1.2.3.4".parse().unwrap(), 80)
        );
        assert_eq!(
            "example.com:443".parse::<Endpoint>().unwrap(),
            Endpoint::domain("example.com", 443)
        );
    }

    #[test]
    fn test_parse_rejects_missing_or_bad_port() {
        assert!(matches!(
            "example.com".parse::<Endpoint>(),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            "example.com:http".parse::<Endpoint>(),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            ":80".parse::<Endpoint>(),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_display_is_host_port() {
        assert_eq!(Endpoint::domain("example.com", 8080).to_string(), "example.com:8080");
        assert_eq!(
            Endpoint::ip_port("10.0.0.1".parse().unwrap(), 53).to_string(),
            "10.0.0.1:53"
        );
    }
}
