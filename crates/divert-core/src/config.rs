//! Resolved proxy configuration.
//!
//! The configuration is assembled once at startup (by the `divert` binary or
//! by tests) and then shared read-only by every connection handler.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use thiserror::Error;

use crate::routing::DomainRuleSet;

/// Default listen port for redirected HTTPS traffic.
pub const DEFAULT_HTTPS_PORT: u16 = 3130;

/// Default listen port for redirected HTTP traffic.
pub const DEFAULT_HTTP_PORT: u16 = 3131;

/// Default upstream proxy port when only a host is given.
pub const DEFAULT_UPSTREAM_PROXY_PORT: u16 = 3128;

/// Default size of the buffer used to sniff the first client bytes.
pub const DEFAULT_SNIFF_BUFFER_SIZE: usize = 4096;

/// Smallest accepted sniff buffer. Anything below cannot hold a ClientHello.
pub const MIN_SNIFF_BUFFER_SIZE: usize = 512;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Both listeners would bind the same port.
    #[error("https and http listeners cannot share port {0}")]
    PortConflict(u16),

    /// The upstream proxy host is empty.
    #[error("upstream proxy host is empty")]
    EmptyProxyHost,

    /// A proxy port was given without a proxy host.
    #[error("proxy port {0} given without a proxy host")]
    ProxyPortWithoutHost(u16),

    /// A timeout is zero.
    #[error("{0} timeout must be greater than zero")]
    ZeroTimeout(&'static str),

    /// The sniff buffer cannot hold a TLS ClientHello.
    #[error("sniff buffer of {0} bytes is too small (minimum {MIN_SNIFF_BUFFER_SIZE})")]
    SniffBufferTooSmall(usize),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Listening addresses for the two interception paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenConfig {
    /// Address both listeners bind to.
    pub host: IpAddr,
    /// Port receiving traffic redirected from port 443.
    pub https_port: u16,
    /// Port receiving traffic redirected from port 80.
    pub http_port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            https_port: DEFAULT_HTTPS_PORT,
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

/// Address of the upstream forward proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    /// Proxy host name or IP.
    pub host: String,
    /// Proxy port.
    pub port: u16,
}

impl UpstreamProxy {
    /// Creates a new upstream proxy address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Upstream proxy settings. No upstream means direct connections only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    /// The upstream proxy, if any.
    pub upstream: Option<UpstreamProxy>,
}

impl ProxyConfig {
    /// Creates a configuration that never uses a proxy.
    pub fn direct() -> Self {
        Self::default()
    }

    /// Creates a configuration tunnelling through `host:port`.
    pub fn upstream(host: impl Into<String>, port: u16) -> Self {
        Self {
            upstream: Some(UpstreamProxy::new(host, port)),
        }
    }

    /// Returns true if an upstream proxy is configured.
    pub fn is_configured(&self) -> bool {
        self.upstream.is_some()
    }
}

/// Time bounds applied to each connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// TCP connect to the target or to the upstream proxy.
    pub connect: Duration,
    /// Waiting for the upstream proxy's CONNECT response.
    pub proxy_handshake: Duration,
    /// Collecting the initial client bytes for sniffing.
    pub sniff: Duration,
    /// Inactivity limit for the relay as a whole (`None` = unbounded).
    pub relay_idle: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            proxy_handshake: Duration::from_secs(10),
            sniff: Duration::from_secs(5),
            relay_idle: None,
        }
    }
}

/// Complete, immutable configuration of the interception engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Listening addresses.
    pub listen: ListenConfig,
    /// Upstream proxy settings.
    pub proxy: ProxyConfig,
    /// Domain routing rules.
    pub rules: DomainRuleSet,
    /// Per-connection time bounds.
    pub timeouts: Timeouts,
    /// Size of the initial sniff buffer in bytes.
    pub sniff_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            proxy: ProxyConfig::default(),
            rules: DomainRuleSet::default(),
            timeouts: Timeouts::default(),
            sniff_buffer_size: DEFAULT_SNIFF_BUFFER_SIZE,
        }
    }
}

impl Config {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listening addresses.
    pub fn with_listen(mut self, listen: ListenConfig) -> Self {
        self.listen = listen;
        self
    }

    /// Sets the upstream proxy settings.
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = proxy;
        self
    }

    /// Sets the domain rules.
    pub fn with_rules(mut self, rules: DomainRuleSet) -> Self {
        self.rules = rules;
        self
    }

    /// Sets the timeouts.
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the sniff buffer size.
    pub fn with_sniff_buffer_size(mut self, size: usize) -> Self {
        self.sniff_buffer_size = size;
        self
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.listen.https_port != 0 && self.listen.https_port == self.listen.http_port {
            return Err(ConfigError::PortConflict(self.listen.https_port));
        }

        if let Some(upstream) = &self.proxy.upstream {
            if upstream.host.trim().is_empty() {
                return Err(ConfigError::EmptyProxyHost);
            }
        }

        if self.timeouts.connect.is_zero() {
            return Err(ConfigError::ZeroTimeout("connect"));
        }
        if self.timeouts.proxy_handshake.is_zero() {
            return Err(ConfigError::ZeroTimeout("proxy handshake"));
        }
        if self.timeouts.sniff.is_zero() {
            return Err(ConfigError::ZeroTimeout("sniff"));
        }
        if self.timeouts.relay_idle.is_some_and(|idle| idle.is_zero()) {
            return Err(ConfigError::ZeroTimeout("relay idle"));
        }

        if self.sniff_buffer_size < MIN_SNIFF_BUFFER_SIZE {
            return Err(ConfigError::SniffBufferTooSmall(self.sniff_buffer_size));
        }

        Ok(())
    }
}
