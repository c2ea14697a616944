//! Node configuration.
//!
//! [`NodeConfig`] carries everything [`crate::Node::start`] needs. The CLI
//! fills it from flags; library users start from `NodeConfig::default()`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::routing::{DiscoveryParams, DEFAULT_ALPHA, DEFAULT_K};
use crate::supervisor::LinkTimeouts;

/// Port a node listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 52386;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Port outside 1..=65535.
    InvalidPort(u32),
    /// The public address has no routable host.
    MissingAddress,
    /// The address could not be parsed as `host:port`.
    InvalidAddress(String),
    /// A tunable is out of range.
    InvalidParameter(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort(port) => write!(f, "'{}' is an invalid port", port),
            ConfigError::MissingAddress => write!(f, "public address has no routable host"),
            ConfigError::InvalidAddress(addr) => write!(f, "'{}' is not a valid host:port address", addr),
            ConfigError::InvalidParameter(name) => write!(f, "invalid value for {}", name),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Accept ports in `1..=65535`.
pub fn validate_port(port: u32) -> Result<u16, ConfigError> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(ConfigError::InvalidPort(port)),
    }
}

/// Parse an operator-supplied public address.
pub fn parse_public_addr(s: &str) -> Result<SocketAddr, ConfigError> {
    let addr: SocketAddr = s
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(s.to_string()))?;
    if addr.ip().is_unspecified() {
        return Err(ConfigError::MissingAddress);
    }
    validate_port(addr.port() as u32)?;
    Ok(addr)
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Interface to bind. Unspecified binds all interfaces.
    pub bind_ip: IpAddr,
    pub port: u16,
    /// Address advertised to peers. Probed from local interfaces when unset.
    pub public_addr: Option<SocketAddr>,
    pub k: usize,
    pub alpha: usize,
    pub handshake_timeout: Duration,
    pub push_timeout: Duration,
    pub ping_timeout: Duration,
    pub query_timeout: Duration,
    pub lookup_timeout: Duration,
    pub max_lookup_rounds: usize,
    /// Bound on the join performed by `Node::start`.
    pub bootstrap_timeout: Duration,
    pub refresh_interval: Duration,
    pub stale_threshold: Duration,
    /// Bound on waiting for tasks and the endpoint during shutdown.
    pub shutdown_timeout: Duration,
    /// Concurrent pushes in one broadcast.
    pub broadcast_concurrency: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let discovery = DiscoveryParams::default();
        let links = LinkTimeouts::default();
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            public_addr: None,
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            handshake_timeout: links.handshake,
            push_timeout: links.push,
            ping_timeout: discovery.ping_timeout,
            query_timeout: discovery.query_timeout,
            lookup_timeout: discovery.lookup_timeout,
            max_lookup_rounds: discovery.max_rounds,
            bootstrap_timeout: Duration::from_secs(15),
            refresh_interval: discovery.refresh_interval,
            stale_threshold: discovery.stale_threshold,
            shutdown_timeout: Duration::from_secs(5),
            broadcast_concurrency: 16,
        }
    }
}

impl NodeConfig {
    /// Default configuration bound to `ip:port`.
    pub fn bound_to(ip: IpAddr, port: u16) -> Self {
        Self {
            bind_ip: ip,
            port,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_port(self.port as u32)?;
        if let Some(addr) = self.public_addr {
            if addr.ip().is_unspecified() {
                return Err(ConfigError::MissingAddress);
            }
            validate_port(addr.port() as u32)?;
        }
        if self.k == 0 {
            return Err(ConfigError::InvalidParameter("k"));
        }
        if self.alpha == 0 {
            return Err(ConfigError::InvalidParameter("alpha"));
        }
        if self.broadcast_concurrency == 0 {
            return Err(ConfigError::InvalidParameter("broadcast_concurrency"));
        }
        let timeouts = [
            ("handshake_timeout", self.handshake_timeout),
            ("push_timeout", self.push_timeout),
            ("ping_timeout", self.ping_timeout),
            ("query_timeout", self.query_timeout),
            ("lookup_timeout", self.lookup_timeout),
            ("bootstrap_timeout", self.bootstrap_timeout),
            ("refresh_interval", self.refresh_interval),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(ConfigError::InvalidParameter(name));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    pub fn discovery_params(&self) -> DiscoveryParams {
        DiscoveryParams {
            k: self.k,
            alpha: self.alpha,
            ping_timeout: self.ping_timeout,
            query_timeout: self.query_timeout,
            lookup_timeout: self.lookup_timeout,
            max_rounds: self.max_lookup_rounds,
            refresh_interval: self.refresh_interval,
            stale_threshold: self.stale_threshold,
        }
    }

    pub fn link_timeouts(&self) -> LinkTimeouts {
        LinkTimeouts {
            handshake: self.handshake_timeout,
            push: self.push_timeout,
            control: self.query_timeout,
        }
    }
}
