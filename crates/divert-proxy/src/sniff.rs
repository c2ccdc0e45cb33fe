//! Target sniffing on the first client bytes.
//!
//! Both interception paths peek at what the client sends first to learn the
//! real target host: the TLS SNI on the HTTPS path and the `Host` header on
//! the HTTP path. The bytes read here are kept and replayed upstream
//! verbatim, so sniffing is invisible to both ends.
//!
//! ## Accumulation
//!
//! A single read may return only part of a ClientHello or request head, so
//! [`read_initial`] keeps reading until the parser is decisive, the buffer
//! is full, the client closes, or the sniff deadline passes.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;

use crate::client_hello::parse_sni;
use crate::connection::Protocol;
use crate::http_host::parse_host;

/// Outcome of parsing the initial client bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffResult {
    /// A target host was extracted.
    Found(String),
    /// The bytes are conclusively not usable; the reason is for logs.
    NotFound(&'static str),
    /// The bytes are a valid prefix; more input is needed to decide.
    Incomplete,
}

impl SniffResult {
    /// Returns the host, if one was found.
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Found(host) => Some(host),
            _ => None,
        }
    }
}

/// Longest host name accepted from either sniffer.
pub(crate) const MAX_HOST_NAME_LEN: usize = 253;

/// Returns true if `name` is usable as a DNS name or IPv4 literal: ASCII
/// letters, digits, `.`, `-` and `_` only.
///
/// Sniffed hosts end up in the CONNECT request line and headers, so
/// whitespace and control bytes must never pass.
pub(crate) fn is_valid_host_name(name: &[u8]) -> bool {
    !name.is_empty()
        && name.len() <= MAX_HOST_NAME_LEN
        && name
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
}

/// Runs the parser matching `protocol` over `data`.
pub fn sniff(protocol: Protocol, data: &[u8]) -> SniffResult {
    match protocol {
        Protocol::Https => parse_sni(data),
        Protocol::Http => parse_host(data),
    }
}

/// What [`read_initial`] got from the client.
#[derive(Debug)]
pub enum Initial {
    /// The client closed without sending anything.
    Closed,
    /// Bytes were received; `data` must be replayed upstream as-is.
    Sniffed {
        /// Every byte read from the client so far.
        data: Vec<u8>,
        /// The final parse result; never [`SniffResult::Incomplete`].
        result: SniffResult,
    },
}

/// Reads from `stream` until the sniffer for `protocol` can decide.
///
/// At most `capacity` bytes are read and the whole operation is bounded by
/// `limit`. An undecided parse at the end becomes
/// [`SniffResult::NotFound`] naming what stopped it.
pub async fn read_initial<S>(
    stream: &mut S,
    protocol: Protocol,
    capacity: usize,
    limit: Duration,
) -> io::Result<Initial>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + limit;
    let mut data = vec![0u8; capacity];
    let mut filled = 0;

    let result = loop {
        let read = tokio::time::timeout_at(deadline, stream.read(&mut data[filled..])).await;
        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) if filled == 0 => break SniffResult::NotFound("timed out waiting for client data"),
            Err(_) => break SniffResult::NotFound("timed out waiting for more client data"),
        };

        if n == 0 {
            if filled == 0 {
                return Ok(Initial::Closed);
            }
            break undecided(sniff(protocol, &data[..filled]), "client closed mid-request");
        }
        filled += n;

        match sniff(protocol, &data[..filled]) {
            SniffResult::Incomplete if filled == capacity => {
                break SniffResult::NotFound("target not within sniff buffer");
            }
            SniffResult::Incomplete => continue,
            decided => break decided,
        }
    };

    data.truncate(filled);
    Ok(Initial::Sniffed { data, result })
}

fn undecided(result: SniffResult, reason: &'static str) -> SniffResult {
    match result {
        SniffResult::Incomplete => SniffResult::NotFound(reason),
        decided => decided,
    }
}
