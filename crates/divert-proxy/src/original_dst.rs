//! Original destination recovery.
//!
//! Connections arrive through a NAT REDIRECT rule, so the socket's local
//! address is the listener, not the server the client dialed. The kernel
//! keeps the pre-NAT destination and exposes it through the
//! `SO_ORIGINAL_DST` socket option (`IP6T_SO_ORIGINAL_DST` for IPv6).
//!
//! The lookup sits behind [`OriginalDstResolver`] so the handler can run
//! without netfilter in tests or on other platforms.

use std::net::SocketAddr;

use tokio::net::TcpStream;

/// Recovers the address a client originally dialed.
pub trait OriginalDstResolver: Send + Sync {
    /// Returns the pre-redirection destination of `stream`, or `None` if it
    /// is unknown or the connection was not redirected.
    fn original_dst(&self, stream: &TcpStream) -> Option<SocketAddr>;
}

/// Queries the kernel's connection tracking through `SO_ORIGINAL_DST`.
///
/// Only Linux and Android provide the option; elsewhere the lookup always
/// yields `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelResolver;

impl OriginalDstResolver for KernelResolver {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn original_dst(&self, stream: &TcpStream) -> Option<SocketAddr> {
        use socket2::SockRef;
        use tracing::trace;

        let local = stream.local_addr().ok()?;
        let sock = SockRef::from(stream);

        // IPv6 sockets may carry v4-mapped traffic tracked under the v4 table.
        let lookup = match local {
            SocketAddr::V4(_) => sock.original_dst(),
            SocketAddr::V6(_) => sock.original_dst_ipv6().or_else(|_| sock.original_dst()),
        };

        let addr = match lookup {
            Ok(addr) => addr.as_socket()?,
            Err(e) => {
                trace!(error = %e, "SO_ORIGINAL_DST unavailable");
                return None;
            }
        };

        not_redirected_to_none(addr, local)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn original_dst(&self, _stream: &TcpStream) -> Option<SocketAddr> {
        None
    }
}

/// A connection made straight to the listener reports its own local
/// address as the original destination.
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
fn not_redirected_to_none(original: SocketAddr, local: SocketAddr) -> Option<SocketAddr> {
    if original == local {
        None
    } else {
        Some(original)
    }
}

/// Never knows the original destination.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullResolver;

impl OriginalDstResolver for NullResolver {
    fn original_dst(&self, _stream: &TcpStream) -> Option<SocketAddr> {
        None
    }
}

/// Reports the same original destination for every connection.
///
/// Useful when traffic is steered by means other than NAT, and in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver(pub SocketAddr);

impl OriginalDstResolver for FixedResolver {
    fn original_dst(&self, _stream: &TcpStream) -> Option<SocketAddr> {
        Some(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[test]
    fn local_address_means_not_redirected() {
        let local: SocketAddr = "127.0.0.1:3130".parse().unwrap();
        let remote: SocketAddr = "93.184.216.34:443".parse().unwrap();
        assert_eq!(not_redirected_to_none(local, local), None);
        assert_eq!(not_redirected_to_none(remote, local), Some(remote));
    }

    #[tokio::test]
    async fn kernel_resolver_without_redirect_is_none() {
        // No NAT rule applies to loopback test traffic.
        let (_client, server) = loopback_pair().await;
        assert_eq!(KernelResolver.original_dst(&server), None);
    }

    #[tokio::test]
    async fn null_and_fixed_resolvers() {
        let (_client, server) = loopback_pair().await;
        let fixed: SocketAddr = "10.1.2.3:8443".parse().unwrap();

        assert_eq!(NullResolver.original_dst(&server), None);
        assert_eq!(FixedResolver(fixed).original_dst(&server), Some(fixed));
    }
}
