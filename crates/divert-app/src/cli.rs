//! Command-line and environment configuration.
//!
//! Every flag can also be set through a `DIVERT_*` environment variable;
//! an explicit flag wins over the environment.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use divert_core::{
    Config, ConfigError, DomainRuleSet, ListenConfig, ProxyConfig, Timeouts, DEFAULT_HTTPS_PORT,
    DEFAULT_HTTP_PORT, DEFAULT_SNIFF_BUFFER_SIZE, DEFAULT_UPSTREAM_PROXY_PORT,
};

/// divert - transparent HTTP/HTTPS interception proxy
#[derive(Parser, Debug)]
#[command(name = "divert", version, about)]
pub struct Args {
    /// Address both listeners bind to
    #[arg(long, env = "DIVERT_LISTEN_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub listen_host: IpAddr,

    /// Port receiving traffic redirected from port 443
    #[arg(long, env = "DIVERT_HTTPS_PORT", default_value_t = DEFAULT_HTTPS_PORT)]
    pub https_port: u16,

    /// Port receiving traffic redirected from port 80
    #[arg(long, env = "DIVERT_HTTP_PORT", default_value_t = DEFAULT_HTTP_PORT)]
    pub http_port: u16,

    /// Upstream forward proxy host (direct connections only when unset)
    #[arg(long, env = "DIVERT_PROXY_HOST")]
    pub proxy_host: Option<String>,

    /// Upstream forward proxy port [default: 3128]
    #[arg(long, env = "DIVERT_PROXY_PORT")]
    pub proxy_port: Option<u16>,

    /// Comma-separated domain suffixes that always connect directly
    #[arg(long, env = "DIVERT_NO_PROXY", default_value = "")]
    pub no_proxy: String,

    /// Comma-separated domain suffixes that use the proxy; others go direct
    #[arg(long, env = "DIVERT_PROXY_ONLY", default_value = "")]
    pub proxy_only: String,

    /// Only match domain suffixes on label boundaries
    #[arg(long, env = "DIVERT_STRICT_DOMAINS")]
    pub strict_domains: bool,

    /// Seconds allowed for a TCP connect
    #[arg(long, env = "DIVERT_CONNECT_TIMEOUT", default_value_t = 10)]
    pub connect_timeout: u64,

    /// Seconds allowed for the upstream proxy to answer CONNECT
    #[arg(long, env = "DIVERT_HANDSHAKE_TIMEOUT", default_value_t = 10)]
    pub handshake_timeout: u64,

    /// Seconds allowed for the client to reveal its target
    #[arg(long, env = "DIVERT_SNIFF_TIMEOUT", default_value_t = 5)]
    pub sniff_timeout: u64,

    /// Seconds a tunnel may carry no data in either direction (unbounded when unset)
    #[arg(long, env = "DIVERT_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Bytes buffered while sniffing the target
    #[arg(long, env = "DIVERT_SNIFF_BUFFER", default_value_t = DEFAULT_SNIFF_BUFFER_SIZE)]
    pub sniff_buffer: usize,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, env = "DIVERT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Also write daily-rotated log files to this directory
    #[arg(long, env = "DIVERT_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

impl Args {
    /// Builds and validates the engine configuration.
    pub fn to_config(&self) -> Result<Config, ConfigError> {
        let proxy_host = self
            .proxy_host
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty());

        let proxy = match (proxy_host, self.proxy_port) {
            (Some(host), port) => {
                ProxyConfig::upstream(host, port.unwrap_or(DEFAULT_UPSTREAM_PROXY_PORT))
            }
            (None, Some(port)) => return Err(ConfigError::ProxyPortWithoutHost(port)),
            (None, None) => ProxyConfig::direct(),
        };

        let config = Config::new()
            .with_listen(ListenConfig {
                host: self.listen_host,
                https_port: self.https_port,
                http_port: self.http_port,
            })
            .with_proxy(proxy)
            .with_rules(
                DomainRuleSet::from_csv(&self.no_proxy, &self.proxy_only)
                    .with_label_boundary(self.strict_domains),
            )
            .with_timeouts(Timeouts {
                connect: Duration::from_secs(self.connect_timeout),
                proxy_handshake: Duration::from_secs(self.handshake_timeout),
                sniff: Duration::from_secs(self.sniff_timeout),
                relay_idle: self.idle_timeout.map(Duration::from_secs),
            })
            .with_sniff_buffer_size(self.sniff_buffer);

        config.validate()?;
        Ok(config)
    }

    /// Returns the effective log level.
    pub fn effective_log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }
}
