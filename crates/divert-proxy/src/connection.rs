//! Per-connection state.
//!
//! A [`Connection`] is created when a redirected socket is accepted and is
//! owned by exactly one handler task until it is closed.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::relay::RelayStats;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a process-unique connection id for log correlation.
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Which interception path accepted the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TLS traffic redirected from port 443; routed by SNI.
    Https,
    /// Plain HTTP traffic redirected from port 80; routed by the Host header.
    Http,
}

impl Protocol {
    /// Returns the protocol name as used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Https => "https",
            Self::Http => "http",
        }
    }

    /// Returns the port the protocol is normally served on.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Https => 443,
            Self::Http => 80,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle stage of a connection.
///
/// Stages only move forward. Any failure jumps straight to `Closed` after
/// both sockets are released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Socket accepted, nothing inspected yet.
    Accepted,
    /// Querying the original destination.
    Resolving,
    /// Reading and parsing the first client bytes.
    Sniffing,
    /// Target known and route chosen.
    RoutingDecided,
    /// Opening the TCP connection to the target or the proxy.
    Connecting,
    /// Waiting for the upstream proxy to accept CONNECT.
    ProxyHandshake,
    /// Copying bytes in both directions.
    Relaying,
    /// Both sockets released.
    Closed,
}

impl Stage {
    /// Returns the stage name as used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Resolving => "resolving",
            Self::Sniffing => "sniffing",
            Self::RoutingDecided => "routing_decided",
            Self::Connecting => "connecting",
            Self::ProxyHandshake => "proxy_handshake",
            Self::Relaying => "relaying",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The host and port the client actually wants to reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host name (or IP literal, without brackets).
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Target {
    /// Creates a new target.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    /// Formats as an authority (`host:port`, IPv6 hosts bracketed).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// An accepted client connection.
#[derive(Debug)]
pub struct Connection<S> {
    pub(crate) id: u64,
    pub(crate) peer: SocketAddr,
    pub(crate) protocol: Protocol,
    pub(crate) stream: S,
    pub(crate) original_dst: Option<SocketAddr>,
    pub(crate) target: Option<Target>,
    pub(crate) stage: Stage,
    pub(crate) stats: RelayStats,
}

impl<S> Connection<S>
where
    S: AsyncWrite + Unpin,
{
    /// Wraps a freshly accepted client stream.
    pub fn new(id: u64, peer: SocketAddr, protocol: Protocol, stream: S) -> Self {
        Self {
            id,
            peer,
            protocol,
            stream,
            original_dst: None,
            target: None,
            stage: Stage::Accepted,
            stats: RelayStats::default(),
        }
    }

    /// Returns the connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the client's address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Returns the interception path.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Returns the pre-redirection destination, if it could be recovered.
    pub fn original_dst(&self) -> Option<SocketAddr> {
        self.original_dst
    }

    /// Returns the sniffed target, once known.
    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    /// Returns the current lifecycle stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Returns the relay byte counters.
    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Returns true once [`Connection::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.stage == Stage::Closed
    }

    pub(crate) fn set_stage(&mut self, stage: Stage) {
        debug_assert!(stage >= self.stage, "stage moved backwards");
        self.stage = stage;
    }

    /// Shuts the client stream down and marks the connection closed.
    ///
    /// Safe to call any number of times; only the first call touches the
    /// socket and logs. Returns true if this call did the closing.
    pub async fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }

        let last_stage = self.stage;
        self.stage = Stage::Closed;
        // The peer may already be gone; a failed shutdown changes nothing.
        let _ = self.stream.shutdown().await;

        let target = self
            .target
            .as_ref()
            .map_or_else(|| "-".to_string(), Target::to_string);
        debug!(
            %last_stage,
            target = %target,
            bytes_up = self.stats.client_to_upstream,
            bytes_down = self.stats.upstream_to_client,
            "connection closed"
        );
        true
    }
}
