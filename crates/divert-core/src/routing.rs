//! Domain routing policy.
//!
//! Decides whether a sniffed target host is reached through the upstream
//! proxy or by a direct connection.
//!
//! ## Evaluation Order
//!
//! 1. `no_proxy` (deny list) - a matching suffix always forces a direct connection
//! 2. `proxy_only` (allow list) - when non-empty, hosts matching none of its
//!    suffixes go direct
//! 3. Otherwise the upstream proxy is used, if one is configured
//!
//! ## Suffix Matching
//!
//! Matching is a plain, case-insensitive "ends with" test, so a rule for
//! `example.com` also matches `notexample.com`. Label-boundary matching is
//! available through [`DomainRuleSet::with_label_boundary`] but is off by
//! default to keep the lenient behaviour existing deployments rely on.

use std::fmt;

/// Ordered deny/allow suffix lists, normalized once at load time.
///
/// The rule set is immutable after construction and is read concurrently
/// by every connection handler without locking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainRuleSet {
    no_proxy: Vec<String>,
    proxy_only: Vec<String>,
    label_boundary: bool,
}

impl DomainRuleSet {
    /// Creates an empty rule set (every host is eligible for the proxy).
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a rule set from deny and allow suffix lists.
    ///
    /// Entries are trimmed and lower-cased; empty entries are dropped.
    pub fn from_lists<I, J, S, T>(no_proxy: I, proxy_only: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        Self {
            no_proxy: normalize(no_proxy),
            proxy_only: normalize(proxy_only),
            label_boundary: false,
        }
    }

    /// Creates a rule set from comma-separated lists, as found in
    /// `NO_PROXY`-style settings.
    ///
    /// # Examples
    ///
    /// ```
    /// use divert_core::DomainRuleSet;
    ///
    /// let rules = DomainRuleSet::from_csv("Internal.Corp, localhost", "");
    /// assert_eq!(rules.no_proxy(), ["internal.corp", "localhost"]);
    /// assert!(rules.proxy_only().is_empty());
    /// ```
    pub fn from_csv(no_proxy: &str, proxy_only: &str) -> Self {
        Self::from_lists(no_proxy.split(','), proxy_only.split(','))
    }

    /// Requires suffix matches to fall on a DNS label boundary.
    ///
    /// With this enabled a rule for `example.com` matches `example.com` and
    /// `a.example.com` but no longer `notexample.com`.
    pub fn with_label_boundary(mut self, enabled: bool) -> Self {
        self.label_boundary = enabled;
        self
    }

    /// Returns the deny-list suffixes.
    pub fn no_proxy(&self) -> &[String] {
        &self.no_proxy
    }

    /// Returns the allow-list suffixes.
    pub fn proxy_only(&self) -> &[String] {
        &self.proxy_only
    }

    /// Returns true if label-boundary matching is enabled.
    pub fn label_boundary(&self) -> bool {
        self.label_boundary
    }

    /// Decides how to reach `host`.
    ///
    /// `proxy_configured` tells whether an upstream proxy exists at all; when
    /// it does not, every host goes direct.
    pub fn decide(&self, host: &str, proxy_configured: bool) -> RoutingDecision {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        if let Some(rule) = self.no_proxy.iter().find(|s| self.matches(&host, s)) {
            return RoutingDecision::Direct(DirectReason::NoProxyRule(rule.clone()));
        }

        if !self.proxy_only.is_empty() && !self.proxy_only.iter().any(|s| self.matches(&host, s))
        {
            return RoutingDecision::Direct(DirectReason::NotProxyOnly);
        }

        if proxy_configured {
            RoutingDecision::Proxy
        } else {
            RoutingDecision::Direct(DirectReason::NoUpstreamProxy)
        }
    }

    fn matches(&self, host: &str, suffix: &str) -> bool {
        if !host.ends_with(suffix) {
            return false;
        }
        if !self.label_boundary || host.len() == suffix.len() || suffix.starts_with('.') {
            return true;
        }
        host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
    }
}

fn normalize<I, S>(entries: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .filter_map(|entry| {
            let entry = entry.as_ref().trim().trim_end_matches('.');
            if entry.is_empty() {
                None
            } else {
                Some(entry.to_ascii_lowercase())
            }
        })
        .collect()
}

/// Why a connection is made directly instead of through the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectReason {
    /// The host matched this `no_proxy` suffix.
    NoProxyRule(String),
    /// A `proxy_only` list exists and the host matched none of it.
    NotProxyOnly,
    /// No upstream proxy is configured.
    NoUpstreamProxy,
}

impl fmt::Display for DirectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoProxyRule(rule) => write!(f, "no_proxy rule '{}'", rule),
            Self::NotProxyOnly => f.write_str("not in proxy_only list"),
            Self::NoUpstreamProxy => f.write_str("no upstream proxy"),
        }
    }
}

/// Per-connection routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Tunnel through the upstream proxy with CONNECT.
    Proxy,
    /// Connect straight to the target.
    Direct(DirectReason),
}

impl RoutingDecision {
    /// Returns true if the upstream proxy should be used.
    pub fn use_proxy(&self) -> bool {
        matches!(self, Self::Proxy)
    }

    /// Returns the route name used in log events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Direct(_) => "direct",
        }
    }
}

impl fmt::Display for RoutingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proxy => f.write_str("proxy"),
            Self::Direct(reason) => write!(f, "direct ({})", reason),
        }
    }
}
