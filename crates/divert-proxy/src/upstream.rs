//! Upstream connections.
//!
//! Opens the outbound side of a tunnel: either a plain TCP connection to
//! the target, or a TCP connection to the forward proxy followed by an
//! HTTP/1.1 `CONNECT` handshake.
//!
//! ## CONNECT Request
//!
//! ```text
//! CONNECT foo.example.com:443 HTTP/1.1
//! Host: foo.example.com:443
//! X-Forwarded-For: 192.0.2.10
//! Forwarded: for=192.0.2.10
//!
//! ```
//!
//! The proxy must answer with a status line starting `HTTP/1.1 200`.
//! Anything read after the response head already belongs to the tunnel and
//! is handed back to the caller.

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::connection::Target;
use crate::error::{ProxyError, Result};

/// Largest CONNECT response head accepted from the upstream proxy.
pub const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Opens a TCP connection to `host:port` within `limit`.
pub async fn connect(host: &str, port: u16, limit: Duration) -> Result<TcpStream> {
    let addr = Target::new(host, port).to_string();

    let stream = match tokio::time::timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(ProxyError::UpstreamConnect { addr, source }),
        Err(_) => return Err(ProxyError::ConnectTimeout { addr }),
    };

    // Small writes (TLS records, CONNECT) should not wait on Nagle.
    if let Err(e) = stream.set_nodelay(true) {
        debug!(addr = %addr, error = %e, "failed to set TCP_NODELAY");
    }
    Ok(stream)
}

/// Builds the CONNECT request for `target` on behalf of `client_ip`.
///
/// # Examples
///
/// ```
/// use divert_proxy::{connection::Target, upstream::connect_request};
///
/// let request = connect_request(&Target::new("a.com", 443), "192.0.2.1".parse().unwrap());
/// assert!(request.starts_with("CONNECT a.com:443 HTTP/1.1\r\n"));
/// assert!(request.ends_with("\r\n\r\n"));
/// ```
pub fn connect_request(target: &Target, client_ip: IpAddr) -> String {
    let client_ip = client_ip.to_canonical();
    // RFC 7239 requires IPv6 node names to be quoted and bracketed.
    let forwarded_for = match client_ip {
        IpAddr::V4(ip) => ip.to_string(),
        IpAddr::V6(ip) => format!("\"[{}]\"", ip),
    };

    format!(
        "CONNECT {target} HTTP/1.1\r\n\
         Host: {target}\r\n\
         X-Forwarded-For: {client_ip}\r\n\
         Forwarded: for={forwarded_for}\r\n\
         \r\n"
    )
}

/// Asks the proxy on `stream` to open a tunnel to `target`.
///
/// Writes the CONNECT request, then reads the response head up to the
/// blank line, all within `limit`. Returns any bytes the proxy sent after
/// the head; they are tunnel payload destined for the client.
pub async fn connect_handshake<S>(
    stream: &mut S,
    target: &Target,
    client_ip: IpAddr,
    limit: Duration,
) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = connect_request(target, client_ip);

    let exchange = async {
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;
        read_response_head(stream, target).await
    };

    let (head, leftover) = match tokio::time::timeout(limit, exchange).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ProxyError::ProxyHandshakeTimeout {
                target: target.to_string(),
            })
        }
    };

    let status_line = head.split(|&b| b == b'\n').next().unwrap_or_default();
    let status_line = String::from_utf8_lossy(status_line).trim_end().to_string();

    if !is_success(&status_line) {
        return Err(ProxyError::ProxyRejected {
            target: target.to_string(),
            status: status_line,
        });
    }

    debug!(target = %target, status = %status_line, leftover = leftover.len(), "CONNECT accepted");
    Ok(leftover)
}

/// Reads until `\r\n\r\n`. Returns the head (without terminator) and any
/// bytes that followed it.
async fn read_response_head<S>(stream: &mut S, target: &Target) -> Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::ProxyRejected {
                target: target.to_string(),
                status: "connection closed before response completed".to_string(),
            });
        }

        // Resume the search a few bytes back in case the terminator straddles reads.
        let search_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_head_end(&buf[search_from..]) {
            let end = search_from + pos;
            let leftover = buf.split_off(end + 4);
            buf.truncate(end);
            return Ok((buf, leftover));
        }

        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(ProxyError::ProxyRejected {
                target: target.to_string(),
                status: format!("response head exceeds {} bytes", MAX_RESPONSE_HEAD),
            });
        }
    }
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn is_success(status_line: &str) -> bool {
    match status_line.strip_prefix("HTTP/1.1 200") {
        Some(rest) => rest.is_empty() || rest.starts_with(' '),
        None => false,
    }
}
