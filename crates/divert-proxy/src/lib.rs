//! Divert Proxy - transparent TCP interception engine.
//!
//! Accepts connections that NAT rules redirected away from ports 443 and 80,
//! learns the real target host from the first bytes the client sends, and
//! tunnels the connection to that host, either directly or through an
//! upstream forward proxy with `CONNECT`.
//!
//! ## Connection Flow
//!
//! ```text
//! accept → original destination (SO_ORIGINAL_DST, advisory)
//!        → sniff target (TLS SNI on the HTTPS path, Host header on the HTTP path)
//!        → route (no_proxy / proxy_only suffix rules)
//!                 │
//!        ┌────────┴──────────┐
//!        │ direct            │ proxy
//!        ▼                   ▼
//!   connect target     connect proxy → CONNECT host:port → 200?
//!        │                   │
//!        └────────┬──────────┘
//!                 ▼
//!        replay sniffed bytes → relay both directions → close
//! ```
//!
//! Nothing is decrypted or rewritten: the upstream receives exactly the byte
//! stream the client sent.
//!
//! ## Example
//!
//! ```no_run
//! use divert_core::{Config, ProxyConfig};
//! use divert_proxy::ProxyServer;
//!
//! # async fn run() -> divert_proxy::Result<()> {
//! let config = Config::new().with_proxy(ProxyConfig::upstream("10.0.0.5", 3128));
//! let handle = ProxyServer::bind(config)?.start();
//! // ... later
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client_hello;
pub mod connection;
mod error;
mod handler;
pub mod http_host;
pub mod original_dst;
mod proxy;
pub mod relay;
mod sniff;
pub mod upstream;

pub use connection::{Connection, Protocol, Stage, Target};
pub use error::{ProxyError, Result};
pub use handler::ConnectionHandler;
pub use original_dst::{FixedResolver, KernelResolver, NullResolver, OriginalDstResolver};
pub use proxy::{ProxyHandle, ProxyServer};
pub use relay::RelayStats;
pub use sniff::{read_initial, sniff, Initial, SniffResult};

#[cfg(test)]
pub(crate) mod test_support {
    //! Builders for synthetic protocol data.

    /// A ClientHello whose only extension is `server_name` for `host`.
    pub fn client_hello(host: &str) -> Vec<u8> {
        client_hello_with(Some(host), &[], true)
    }

    /// A ClientHello with `extra` extensions, followed by `server_name` when
    /// `sni` is given. Without `with_extensions` the extensions block is
    /// omitted entirely.
    pub fn client_hello_with(
        sni: Option<&str>,
        extra: &[(u16, Vec<u8>)],
        with_extensions: bool,
    ) -> Vec<u8> {
        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0x11; 32]);
        body.push(32);
        body.extend_from_slice(&[0x22; 32]);
        body.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0x13, 0x02]);
        body.extend_from_slice(&[0x01, 0x00]);

        if with_extensions {
            let mut extensions = Vec::new();
            for (ext_type, data) in extra {
                push_extension(&mut extensions, *ext_type, data);
            }
            if let Some(host) = sni {
                let name = host.as_bytes();
                let mut list = Vec::new();
                list.push(0x00);
                list.extend_from_slice(&(name.len() as u16).to_be_bytes());
                list.extend_from_slice(name);

                let mut data = (list.len() as u16).to_be_bytes().to_vec();
                data.extend_from_slice(&list);
                push_extension(&mut extensions, 0x0000, &data);
            }
            body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
            body.extend_from_slice(&extensions);
        }

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    fn push_extension(out: &mut Vec<u8>, ext_type: u16, data: &[u8]) {
        out.extend_from_slice(&ext_type.to_be_bytes());
        out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        out.extend_from_slice(data);
    }
}
