//! HTTP/1.x `Host` header extraction.
//!
//! Only the request head is examined. Header lines are read until a `Host`
//! header or the blank line that ends the head; the body is never touched.

use std::net::Ipv6Addr;

use crate::sniff::{is_valid_host_name, SniffResult};

/// Extracts the `Host` header value from the start of an HTTP/1.x request.
///
/// The returned value is trimmed and may still carry a port. It is only
/// returned if [`split_host_port`] accepts it, so it never contains
/// whitespace or control bytes. One empty line before the request line is
/// skipped.
///
/// # Examples
///
/// ```
/// use divert_proxy::{http_host::parse_host, SniffResult};
///
/// let request = b"GET / HTTP/1.1\r\nhost: Example.com:8080\r\n\r\n";
/// assert_eq!(parse_host(request), SniffResult::Found("Example.com:8080".into()));
/// assert_eq!(parse_host(b"GET / HTTP/1.1\r\nAcc"), SniffResult::Incomplete);
/// ```
pub fn parse_host(data: &[u8]) -> SniffResult {
    let data = match data {
        [b'\r'] => return SniffResult::Incomplete,
        [b'\r', b'\n', rest @ ..] => rest,
        _ => data,
    };

    match data.first() {
        None => return SniffResult::Incomplete,
        Some(b) if !b.is_ascii_uppercase() => {
            return SniffResult::NotFound("not an HTTP request");
        }
        Some(_) => {}
    }

    let mut rest = data;
    let mut request_line = true;

    while let Some(end) = find_crlf(rest) {
        let line = &rest[..end];
        rest = &rest[end + 2..];

        if request_line {
            request_line = false;
            if !line.contains(&b' ') {
                return SniffResult::NotFound("malformed request line");
            }
            continue;
        }

        if line.is_empty() {
            return SniffResult::NotFound("no Host header");
        }

        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        if !line[..colon].eq_ignore_ascii_case(b"host") {
            continue;
        }

        return match std::str::from_utf8(&line[colon + 1..]).map(str::trim) {
            Ok("") => SniffResult::NotFound("empty Host header"),
            Ok(value) if split_host_port(value).is_some() => SniffResult::Found(value.to_string()),
            Ok(_) => SniffResult::NotFound("invalid Host header"),
            Err(_) => SniffResult::NotFound("Host header is not valid UTF-8"),
        };
    }

    SniffResult::Incomplete
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Splits a `Host` header value into host and optional port.
///
/// Accepts `host`, `host:port`, `[v6]` and `[v6]:port`. A bare IPv6 literal
/// (more than one colon, no brackets) is taken as a host without port.
/// Returns `None` for a port that is not a valid `u16`, an IPv6 part that
/// does not parse, or a host name with anything but letters, digits, `.`,
/// `-` and `_`.
///
/// # Examples
///
/// ```
/// use divert_proxy::http_host::split_host_port;
///
/// assert_eq!(split_host_port("a.com:8080"), Some(("a.com".to_string(), Some(8080))));
/// assert_eq!(split_host_port("[::1]"), Some(("::1".to_string(), None)));
/// assert_eq!(split_host_port("a.com:http"), None);
/// ```
pub fn split_host_port(value: &str) -> Option<(String, Option<u16>)> {
    let value = value.trim();

    if let Some(rest) = value.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        host.parse::<Ipv6Addr>().ok()?;
        let port = match after {
            "" => None,
            _ => Some(parse_port(after.strip_prefix(':')?)?),
        };
        return Some((host.to_string(), port));
    }

    let (host, port) = match value.matches(':').count() {
        0 => (value, None),
        1 => {
            let (host, port) = value.split_once(':')?;
            (host, Some(parse_port(port)?))
        }
        _ => {
            value.parse::<Ipv6Addr>().ok()?;
            return Some((value.to_string(), None));
        }
    };

    if !is_valid_host_name(host.as_bytes()) {
        return None;
    }
    Some((host.to_string(), port))
}

fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
