//! Error types for the interception engine.

use std::net::SocketAddr;

use thiserror::Error;

use crate::connection::Protocol;

/// Proxy error type.
///
/// Every variant is local to one connection (or, for [`ProxyError::Bind`],
/// to listener startup); nothing here is shared across connections.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A listening socket could not be set up.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address we tried to bind.
        addr: SocketAddr,
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// No target host could be found in the initial client bytes.
    #[error("no {protocol} target found: {reason}")]
    Sniff {
        /// Which interception path was sniffing.
        protocol: Protocol,
        /// What went wrong.
        reason: &'static str,
    },

    /// TCP connect to the target or the upstream proxy failed.
    #[error("failed to connect to {addr}: {source}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// TCP connect did not complete in time.
    #[error("timed out connecting to {addr}")]
    ConnectTimeout {
        /// The address we tried to connect to.
        addr: String,
    },

    /// The target is one of our own listeners; dialing it would loop.
    #[error("refusing to connect to own listener {addr}")]
    SelfConnect {
        /// The listener address the target resolved to.
        addr: SocketAddr,
    },

    /// The upstream proxy answered CONNECT with something other than 200.
    #[error("upstream proxy rejected CONNECT {target}: {status}")]
    ProxyRejected {
        /// The `host:port` requested.
        target: String,
        /// The status line (or a description of the malformed response).
        status: String,
    },

    /// The upstream proxy did not finish the CONNECT response in time.
    #[error("upstream proxy did not answer CONNECT {target} in time")]
    ProxyHandshakeTimeout {
        /// The `host:port` requested.
        target: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Returns true for failures caused by the upstream proxy's CONNECT handling.
    pub fn is_proxy_rejection(&self) -> bool {
        matches!(
            self,
            ProxyError::ProxyRejected { .. } | ProxyError::ProxyHandshakeTimeout { .. }
        )
    }

    /// Returns true if the target (or proxy) could not be reached at all.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamConnect { .. }
                | ProxyError::ConnectTimeout { .. }
                | ProxyError::SelfConnect { .. }
        )
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
