//! Divert Core - configuration and routing policy.
//!
//! This crate holds the pieces of the interception engine that involve no
//! I/O: the resolved [`Config`] every connection handler reads, and the
//! [`DomainRuleSet`] that turns a sniffed host name into a
//! [`RoutingDecision`].
//!
//! ```
//! use divert_core::{Config, DomainRuleSet, ProxyConfig};
//!
//! let config = Config::new()
//!     .with_proxy(ProxyConfig::upstream("10.0.0.5", 3128))
//!     .with_rules(DomainRuleSet::from_csv("internal.corp", ""));
//!
//! assert!(config.rules.decide("foo.example.com", true).use_proxy());
//! assert!(!config.rules.decide("git.internal.corp", true).use_proxy());
//! ```

pub mod config;
pub mod routing;

pub use config::{
    Config, ConfigError, ListenConfig, ProxyConfig, Timeouts, UpstreamProxy,
    DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT, DEFAULT_SNIFF_BUFFER_SIZE, DEFAULT_UPSTREAM_PROXY_PORT,
    MIN_SNIFF_BUFFER_SIZE,
};
pub use routing::{DirectReason, DomainRuleSet, RoutingDecision};
