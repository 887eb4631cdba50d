//! Configuration module for Tunium
//!
//! JSON configuration consumed by an embedding host or the bundled
//! binary. Every field carries a serde default so a minimal config
//! stays minimal; `validate` gates engine construction so a bad
//! config never produces a partially started tunnel.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use crate::error::{Error, Result};
use crate::router::{Rule, RuleAction};

/// DNS servers answer on this port unless one is given explicitly
const DNS_PORT: u16 = 53;

/// Smallest MTU the tunnel accepts (IPv4 minimum reassembly size)
const MIN_MTU: u16 = 576;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Tunnel interface settings
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Upstream proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// DNS resolver settings
    #[serde(default)]
    pub dns: DnsConfig,

    /// Initial classification rules, evaluated in order
    #[serde(default)]
    pub rules: Vec<Rule>,
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
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Create a default configuration with a couple of sample rules
    pub fn default_config() -> Self {
        Config {
            log: LogConfig::default(),
            tunnel: TunnelConfig::default(),
            proxy: ProxyConfig::default(),
            dns: DnsConfig::default(),
            rules: vec![
                Rule::new("ads.", RuleAction::Reject),
                Rule::new("10.10.", RuleAction::Proxy),
            ],
        }
    }

    /// Check the configuration before anything is started
    pub fn validate(&self) -> Result<()> {
        if self.proxy.host.trim().is_empty() {
            return Err(Error::Config("proxy host must not be empty".to_string()));
        }
        if self.proxy.port == 0 {
            return Err(Error::Config("proxy port must not be zero".to_string()));
        }
        if self.tunnel.mtu < MIN_MTU {
            return Err(Error::Config(format!(
                "mtu {} below the minimum of {}",
                self.tunnel.mtu, MIN_MTU
            )));
        }
        self.tunnel.local_address.parse::<Ipv4Addr>().map_err(|_| {
            Error::Config(format!(
                "invalid tunnel local address: {}",
                self.tunnel.local_address
            ))
        })?;
        if self.dns.servers.is_empty() {
            return Err(Error::Config("dns server list must not be empty".to_string()));
        }
        self.dns.server_addrs()?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log: LogConfig::default(),
            tunnel: TunnelConfig::default(),
            proxy: ProxyConfig::default(),
            dns: DnsConfig::default(),
            rules: Vec::new(),
        }
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

/// Tunnel interface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Address assigned to the tunnel side of the interface
    #[serde(default = "default_local_address")]
    pub local_address: String,

    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

fn default_local_address() -> String {
    "192.168.1.2".to_string()
}

fn default_mtu() -> u16 {
    1500
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_address: default_local_address(),
            mtu: default_mtu(),
        }
    }
}

/// Upstream SOCKS5 proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy host (IP or domain)
    #[serde(default = "default_proxy_host")]
    pub host: String,

    /// Proxy port
    #[serde(default = "default_proxy_port")]
    pub port: u16,

    /// Seconds allowed for the TCP connect to the proxy
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Seconds a quiet connection is kept before being closed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

fn default_proxy_host() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_port() -> u16 {
    1080
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    90
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_proxy_host(),
            port: default_proxy_port(),
            connect_timeout: default_connect_timeout(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// DNS resolver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Upstream servers, as `ip` (port 53 implied) or `ip:port`
    #[serde(default = "default_dns_servers")]
    pub servers: Vec<String>,
}

fn default_dns_servers() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()]
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            servers: default_dns_servers(),
        }
    }
}

impl DnsConfig {
    /// Parse the configured servers into socket addresses
    pub fn server_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.servers
            .iter()
            .map(|s| {
                if let Ok(addr) = s.parse::<SocketAddr>() {
                    return Ok(addr);
                }
                s.parse::<IpAddr>()
                    .map(|ip| SocketAddr::new(ip, DNS_PORT))
                    .map_err(|_| Error::Config(format!("invalid dns server: {}", s)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_yields_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.tunnel.local_address, "192.168.1.2");
        assert_eq!(config.tunnel.mtu, 1500);
        assert_eq!(config.dns.servers, vec!["8.8.8.8", "8.8.4.4"]);
        assert!(config.rules.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = Config::default_config();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.rules.len(), config.rules.len());
        assert_eq!(parsed.proxy.port, config.proxy.port);
    }

    #[test]
    fn test_rules_parse_with_lowercase_actions() {
        let config = Config::from_json(
            r#"{"rules":[{"pattern":"ads.","action":"reject"},{"pattern":"example","action":"proxy"}]}"#,
        )
        .unwrap();
        assert_eq!(config.rules[0].action, RuleAction::Reject);
        assert_eq!(config.rules[1].action, RuleAction::Proxy);
    }

    #[test]
    fn test_validate_rejects_empty_proxy_host() {
        let mut config = Config::default();
        config.proxy.host = "".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_proxy_port() {
        let mut config = Config::default();
        config.proxy.port = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_tiny_mtu() {
        let mut config = Config::default();
        config.tunnel.mtu = 100;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_tunnel_address() {
        let mut config = Config::default();
        config.tunnel.local_address = "not-an-ip".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_unparseable_dns_server() {
        let mut config = Config::default();
        config.dns.servers = vec!["dns.invalid".to_string()];
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_dns_list() {
        let mut config = Config::default();
        config.dns.servers = Vec::new();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_server_addrs_imply_port_53() {
        let dns = DnsConfig {
            servers: vec!["1.1.1.1".to_string(), "9.9.9.9:5353".to_string()],
        };
        let addrs = dns.server_addrs().unwrap();
        assert_eq!(addrs[0], "1.1.1.1:53".parse().unwrap());
        assert_eq!(addrs[1], "9.9.9.9:5353".parse().unwrap());
    }
}
