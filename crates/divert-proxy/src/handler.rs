//! Per-connection orchestration.
//!
//! A [`ConnectionHandler`] drives one accepted socket through its whole
//! life: resolve the original destination, sniff the target, decide the
//! route, connect upstream, replay the sniffed bytes, relay, close.
//!
//! ## Failure Handling
//!
//! A direct route never dials one of the proxy's own listeners: a client
//! naming the listener in its `Host` header would otherwise make every hop
//! open another connection to itself.
//!
//! Every failure is local to the connection. Nothing is retried and nothing
//! is written back to the client; it simply sees the socket close. Both
//! sockets are released exactly once: the upstream socket by going out of
//! scope, the client socket by [`Connection::close`].

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use divert_core::{Config, RoutingDecision};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::connection::{next_connection_id, Connection, Protocol, Stage, Target};
use crate::error::{ProxyError, Result};
use crate::http_host::split_host_port;
use crate::original_dst::{KernelResolver, OriginalDstResolver};
use crate::relay::{is_expected_disconnect, relay, RelayStats};
use crate::sniff::{read_initial, Initial, SniffResult};
use crate::upstream;

/// How a connection ended when no error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The client closed before sending a single byte.
    ClientClosed,
    /// The tunnel ran until both directions finished.
    Relayed(RelayStats),
}

/// Handles accepted connections for both interception paths.
///
/// Cheap to clone; every clone shares the same configuration and resolver.
#[derive(Clone)]
pub struct ConnectionHandler {
    config: Arc<Config>,
    resolver: Arc<dyn OriginalDstResolver>,
    listeners: Arc<[SocketAddr]>,
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("config", &self.config)
            .field("resolver", &"OriginalDstResolver")
            .field("listeners", &self.listeners)
            .finish()
    }
}

impl ConnectionHandler {
    /// Creates a handler that queries the kernel for original destinations.
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_resolver(config, Arc::new(KernelResolver))
    }

    /// Creates a handler with a custom original-destination resolver.
    pub fn with_resolver(config: Arc<Config>, resolver: Arc<dyn OriginalDstResolver>) -> Self {
        Self {
            config,
            resolver,
            listeners: Arc::from([]),
        }
    }

    /// Sets the addresses this process listens on. Direct connections to
    /// any of them are refused.
    pub fn with_listeners(mut self, addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.listeners = addrs.into_iter().collect();
        self
    }

    /// Returns the shared configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs one accepted connection to completion.
    ///
    /// Never fails: errors are logged inside the connection's span and the
    /// client socket is closed.
    pub async fn handle(&self, stream: TcpStream, peer: SocketAddr, protocol: Protocol) {
        let id = next_connection_id();
        let span = info_span!("conn", id, protocol = protocol.as_str(), client = %peer);
        self.handle_accepted(id, stream, peer, protocol)
            .instrument(span)
            .await
    }

    async fn handle_accepted(
        &self,
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        protocol: Protocol,
    ) {
        debug!("connection accepted");

        let mut conn = Connection::new(id, peer, protocol, stream);
        conn.set_stage(Stage::Resolving);
        conn.original_dst = self.resolver.original_dst(&conn.stream);

        match self.serve(&mut conn).await {
            Ok(Outcome::ClientClosed) => debug!("client closed without sending data"),
            Ok(Outcome::Relayed(_)) => {}
            Err(e) => report_failure(&conn, &e),
        }

        conn.close().await;
    }

    /// Everything after original-destination resolution. The caller closes
    /// the client stream whatever the result.
    pub(crate) async fn serve<S>(&self, conn: &mut Connection<S>) -> Result<Outcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let protocol = conn.protocol;
        let timeouts = self.config.timeouts;

        conn.set_stage(Stage::Sniffing);
        let initial = read_initial(
            &mut conn.stream,
            protocol,
            self.config.sniff_buffer_size,
            timeouts.sniff,
        )
        .await?;

        let (initial, sniffed) = match initial {
            Initial::Closed => return Ok(Outcome::ClientClosed),
            Initial::Sniffed { data, result } => (data, result),
        };

        let raw_host = match sniffed {
            SniffResult::Found(host) => host,
            SniffResult::NotFound(reason) => return Err(ProxyError::Sniff { protocol, reason }),
            SniffResult::Incomplete => {
                return Err(ProxyError::Sniff {
                    protocol,
                    reason: "incomplete initial data",
                })
            }
        };

        let target = resolve_target(protocol, &raw_host, conn.original_dst)
            .map_err(|reason| ProxyError::Sniff { protocol, reason })?;
        let route = self
            .config
            .rules
            .decide(&target.host, self.config.proxy.is_configured());

        conn.target = Some(target.clone());
        conn.set_stage(Stage::RoutingDecided);
        info!(
            client = %conn.peer,
            original_dst = %format_addr(conn.original_dst),
            target = %target,
            route = route.as_str(),
            reason = %route,
            "routing decision"
        );

        conn.set_stage(Stage::Connecting);
        let (mut upstream, leftover) = match (&self.config.proxy.upstream, &route) {
            (Some(proxy), RoutingDecision::Proxy) => {
                let mut stream = upstream::connect(&proxy.host, proxy.port, timeouts.connect).await?;
                conn.set_stage(Stage::ProxyHandshake);
                let leftover = upstream::connect_handshake(
                    &mut stream,
                    &target,
                    conn.peer.ip(),
                    timeouts.proxy_handshake,
                )
                .await?;
                (stream, leftover)
            }
            _ => {
                if let Some(addr) = self.listener_for_target(&target) {
                    return Err(ProxyError::SelfConnect { addr });
                }
                let stream = upstream::connect(&target.host, target.port, timeouts.connect).await?;
                // A host name may still resolve to one of our listeners.
                if let (Ok(peer), Ok(local)) = (stream.peer_addr(), stream.local_addr()) {
                    if let Some(addr) = matching_listener(&self.listeners, peer, Some(local.ip())) {
                        return Err(ProxyError::SelfConnect { addr });
                    }
                }
                (stream, Vec::new())
            }
        };

        // The sniffed bytes go first so the upstream sees the client's
        // stream unchanged.
        upstream.write_all(&initial).await?;
        if !leftover.is_empty() {
            conn.stream.write_all(&leftover).await?;
        }

        conn.set_stage(Stage::Relaying);
        let stats = relay(&mut conn.stream, &mut upstream, timeouts.relay_idle).await;
        conn.stats = stats;
        Ok(Outcome::Relayed(stats))
    }

    fn listener_for_target(&self, target: &Target) -> Option<SocketAddr> {
        let ip = target.host.parse::<IpAddr>().ok()?;
        matching_listener(&self.listeners, SocketAddr::new(ip, target.port), None)
    }
}

/// Returns the listener that a connection to `addr` would reach.
///
/// `local_ip` is our end of an established connection to `addr`; a
/// wildcard listener is reached through any local address.
fn matching_listener(
    listeners: &[SocketAddr],
    addr: SocketAddr,
    local_ip: Option<IpAddr>,
) -> Option<SocketAddr> {
    let ip = addr.ip().to_canonical();
    let local_ip = local_ip.map(|ip| ip.to_canonical());

    listeners.iter().copied().find(|listener| {
        let bound = listener.ip().to_canonical();
        listener.port() == addr.port()
            && (bound == ip
                || (bound.is_unspecified()
                    && (ip.is_loopback() || ip.is_unspecified() || local_ip == Some(ip))))
    })
}

/// Turns a sniffed host into the connection target.
///
/// HTTPS: the SNI host, on the original destination port or 443.
/// HTTP: the `Host` value, on its own port, else the original destination
/// port, else 80.
pub(crate) fn resolve_target(
    protocol: Protocol,
    raw_host: &str,
    original_dst: Option<SocketAddr>,
) -> std::result::Result<Target, &'static str> {
    let original_port = original_dst.map(|addr| addr.port());

    match protocol {
        Protocol::Https => Ok(Target::new(
            raw_host,
            original_port.unwrap_or(protocol.default_port()),
        )),
        Protocol::Http => {
            let (host, port) = split_host_port(raw_host).ok_or("invalid Host header")?;
            let port = port.or(original_port).unwrap_or(protocol.default_port());
            Ok(Target::new(host, port))
        }
    }
}

fn format_addr(addr: Option<SocketAddr>) -> String {
    addr.map_or_else(|| "-".to_string(), |addr| addr.to_string())
}

fn report_failure<S>(conn: &Connection<S>, err: &ProxyError) {
    let stage = conn.stage;
    let target = conn
        .target
        .as_ref()
        .map_or_else(|| "-".to_string(), Target::to_string);

    match err {
        ProxyError::Sniff { .. } => {
            warn!(%stage, original_dst = %format_addr(conn.original_dst), error = %err, "sniff failed");
        }
        e if e.is_proxy_rejection() => {
            warn!(%stage, target = %target, error = %err, "proxy handshake failed");
        }
        e if e.is_connect_failure() => {
            warn!(%stage, target = %target, error = %err, "upstream connect failed");
        }
        ProxyError::Io(io) if is_expected_disconnect(io) => {
            debug!(%stage, target = %target, error = %err, "peer disconnected");
        }
        _ => warn!(%stage, target = %target, error = %err, "connection failed"),
    }
}
