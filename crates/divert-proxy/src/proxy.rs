//! Interception listeners.
//!
//! Binds the HTTPS-path and HTTP-path listening sockets and hands every
//! accepted connection to its own [`ConnectionHandler`] task. The two accept
//! loops share nothing but the immutable configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use divert_core::Config;
use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::connection::Protocol;
use crate::error::{ProxyError, Result};
use crate::handler::ConnectionHandler;
use crate::original_dst::OriginalDstResolver;

/// Listen backlog for both sockets.
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed accept, so descriptor exhaustion does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// The two bound interception listeners.
#[derive(Debug)]
pub struct ProxyServer {
    https: TcpListener,
    http: TcpListener,
    https_addr: SocketAddr,
    http_addr: SocketAddr,
    handler: ConnectionHandler,
}

impl ProxyServer {
    /// Binds both listeners described by `config`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let handler = ConnectionHandler::new(config.clone());
        Self::bind_with_handler(&config, handler)
    }

    /// Binds both listeners, using `resolver` for original destinations.
    pub fn bind_with_resolver(
        config: Config,
        resolver: Arc<dyn OriginalDstResolver>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let handler = ConnectionHandler::with_resolver(config.clone(), resolver);
        Self::bind_with_handler(&config, handler)
    }

    fn bind_with_handler(config: &Config, handler: ConnectionHandler) -> Result<Self> {
        let host = config.listen.host;
        let https = bind_listener(SocketAddr::new(host, config.listen.https_port))?;
        let http = bind_listener(SocketAddr::new(host, config.listen.http_port))?;

        // Port 0 binds resolve to the real port only now.
        let https_addr = https.local_addr()?;
        let http_addr = http.local_addr()?;

        Ok(Self {
            https,
            http,
            https_addr,
            http_addr,
            handler: handler.with_listeners([https_addr, http_addr]),
        })
    }

    /// Returns the bound HTTPS-path address.
    pub fn https_addr(&self) -> SocketAddr {
        self.https_addr
    }

    /// Returns the bound HTTP-path address.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Runs both accept loops for the lifetime of the process.
    pub async fn run(self) {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let https_rx = shutdown_tx.subscribe();
        let http_rx = shutdown_tx.subscribe();
        self.serve(https_rx, http_rx).await;
    }

    /// Starts both accept loops in the background.
    ///
    /// Returns a handle that can be used to stop them. Dropping the handle
    /// stops them too.
    pub fn start(self) -> ProxyHandle {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        // Subscribe before spawning so an early shutdown is not missed.
        let https_rx = shutdown_tx.subscribe();
        let http_rx = shutdown_tx.subscribe();
        let https_addr = self.https_addr;
        let http_addr = self.http_addr;

        let handle = tokio::spawn(self.serve(https_rx, http_rx));

        ProxyHandle {
            shutdown_tx,
            https_addr,
            http_addr,
            handle,
        }
    }

    async fn serve(self, https_rx: broadcast::Receiver<()>, http_rx: broadcast::Receiver<()>) {
        let upstream = self
            .handler
            .config()
            .proxy
            .upstream
            .as_ref()
            .map_or_else(|| "none".to_string(), ToString::to_string);
        info!(
            https = %self.https_addr,
            http = %self.http_addr,
            upstream_proxy = %upstream,
            "interception listeners started"
        );

        tokio::join!(
            accept_loop(self.https, Protocol::Https, self.handler.clone(), https_rx),
            accept_loop(self.http, Protocol::Http, self.handler, http_rx),
        );

        info!("interception listeners stopped");
    }
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let bind_err = |source: std::io::Error| ProxyError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

    TcpListener::from_std(socket.into()).map_err(bind_err)
}

async fn accept_loop(
    listener: TcpListener,
    protocol: Protocol,
    handler: ConnectionHandler,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.handle(stream, peer, protocol).await;
                    });
                }
                Err(e) => {
                    warn!(protocol = protocol.as_str(), error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            _ = shutdown.recv() => break,
        }
    }
}

/// Handle for controlling running listeners.
#[derive(Debug)]
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    https_addr: SocketAddr,
    http_addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the HTTPS-path address.
    pub fn https_addr(&self) -> SocketAddr {
        self.https_addr
    }

    /// Returns the HTTP-path address.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Signals both accept loops to stop. In-flight connections continue.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the accept loops to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Stops the accept loops and waits for them to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Target;
    use crate::original_dst::{FixedResolver, NullResolver};
    use crate::test_support::client_hello;
    use crate::upstream::connect_request;
    use divert_core::{DomainRuleSet, ListenConfig, ProxyConfig};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    const WAIT: Duration = Duration::from_secs(5);

    fn loopback_config() -> Config {
        Config::new().with_listen(ListenConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            https_port: 0,
            http_port: 0,
        })
    }

    fn start(config: Config, resolver: Arc<dyn OriginalDstResolver>) -> ProxyHandle {
        ProxyServer::bind_with_resolver(config, resolver)
            .unwrap()
            .start()
    }

    async fn fake_server() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut byte).await.unwrap();
            assert_eq!(n, 1, "stream closed before end of head");
            head.push(byte[0]);
        }
        head
    }

    async fn read_exactly<S: AsyncRead + Unpin>(stream: &mut S, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    // ==================== Listener Tests ====================

    #[tokio::test]
    async fn binds_ephemeral_ports() {
        let server = ProxyServer::bind(loopback_config()).unwrap();
        assert_ne!(server.https_addr().port(), 0);
        assert_ne!(server.http_addr().port(), 0);
        assert_ne!(server.https_addr(), server.http_addr());
    }

    #[tokio::test]
    async fn bind_conflict_is_bind_error() {
        let (taken, port) = fake_server().await;
        let config = loopback_config().with_listen(ListenConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            https_port: port,
            http_port: 0,
        });

        let err = ProxyServer::bind(config).unwrap_err();
        assert!(matches!(err, ProxyError::Bind { addr, .. } if addr.port() == port));
        drop(taken);
    }

    #[tokio::test]
    async fn stop_closes_listeners() {
        let handle = start(loopback_config(), Arc::new(NullResolver));
        let https = handle.https_addr();
        let http = handle.http_addr();

        handle.stop().await;

        assert!(TcpStream::connect(https).await.is_err());
        assert!(TcpStream::connect(http).await.is_err());
    }

    // ==================== End-to-End Tests ====================

    #[tokio::test]
    async fn https_via_upstream_proxy() {
        let (proxy, proxy_port) = fake_server().await;
        let config = loopback_config().with_proxy(ProxyConfig::upstream("127.0.0.1", proxy_port));
        let handle = start(config, Arc::new(NullResolver));

        let hello = client_hello("foo.example.com");
        let mut client = TcpStream::connect(handle.https_addr()).await.unwrap();
        client.write_all(&hello).await.unwrap();

        let (mut tunnel, _) = tokio::time::timeout(WAIT, proxy.accept())
            .await
            .unwrap()
            .unwrap();
        let head = read_head(&mut tunnel).await;
        let expected = connect_request(
            &Target::new("foo.example.com", 443),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        );
        assert_eq!(String::from_utf8(head).unwrap(), expected);

        tunnel
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();

        // The ClientHello is replayed verbatim, then the tunnel is transparent.
        assert_eq!(read_exactly(&mut tunnel, hello.len()).await, hello);
        tunnel.write_all(b"server hello").await.unwrap();
        assert_eq!(read_exactly(&mut client, 12).await, b"server hello");
        client.write_all(b"finished").await.unwrap();
        assert_eq!(read_exactly(&mut tunnel, 8).await, b"finished");

        handle.stop().await;
    }

    #[tokio::test]
    async fn https_no_proxy_rule_connects_direct() {
        let (proxy, proxy_port) = fake_server().await;
        let (origin, origin_port) = fake_server().await;
        let config = loopback_config()
            .with_proxy(ProxyConfig::upstream("127.0.0.1", proxy_port))
            .with_rules(DomainRuleSet::from_csv("localhost", ""));
        let original = SocketAddr::from(([127, 0, 0, 1], origin_port));
        let handle = start(config, Arc::new(FixedResolver(original)));

        let hello = client_hello("localhost");
        let mut client = TcpStream::connect(handle.https_addr()).await.unwrap();
        client.write_all(&hello).await.unwrap();

        let (mut server, _) = tokio::time::timeout(WAIT, origin.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read_exactly(&mut server, hello.len()).await, hello);
        server.write_all(b"direct").await.unwrap();
        assert_eq!(read_exactly(&mut client, 6).await, b"direct");

        // No CONNECT was ever attempted.
        assert!(
            tokio::time::timeout(Duration::from_millis(100), proxy.accept())
                .await
                .is_err()
        );

        handle.stop().await;
    }

    #[tokio::test]
    async fn proxy_rejection_closes_both_sides() {
        let (proxy, proxy_port) = fake_server().await;
        let config = loopback_config().with_proxy(ProxyConfig::upstream("127.0.0.1", proxy_port));
        let handle = start(config, Arc::new(NullResolver));

        let mut client = TcpStream::connect(handle.https_addr()).await.unwrap();
        client.write_all(&client_hello("foo.example.com")).await.unwrap();

        let (mut tunnel, _) = tokio::time::timeout(WAIT, proxy.accept())
            .await
            .unwrap()
            .unwrap();
        read_head(&mut tunnel).await;
        tunnel
            .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
            .await
            .unwrap();

        // The proxy side is closed without any ClientHello replay...
        let mut replayed = Vec::new();
        tokio::time::timeout(WAIT, tunnel.read_to_end(&mut replayed))
            .await
            .unwrap()
            .unwrap();
        assert!(replayed.is_empty());

        // ...and the client just sees its connection close.
        let mut received = Vec::new();
        tokio::time::timeout(WAIT, client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_empty());

        handle.stop().await;
    }

    #[tokio::test]
    async fn host_naming_own_listener_is_closed_not_looped() {
        let handle = start(loopback_config(), Arc::new(NullResolver));
        let http = handle.http_addr();

        let mut client = TcpStream::connect(http).await.unwrap();
        let request = format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", http);
        client.write_all(request.as_bytes()).await.unwrap();

        let mut received = Vec::new();
        tokio::time::timeout(WAIT, client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_empty());

        handle.stop().await;
    }

    #[tokio::test]
    async fn silent_client_never_reaches_upstream() {
        let (proxy, proxy_port) = fake_server().await;
        let config = loopback_config().with_proxy(ProxyConfig::upstream("127.0.0.1", proxy_port));
        let handle = start(config, Arc::new(NullResolver));

        let mut client = TcpStream::connect(handle.https_addr()).await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        tokio::time::timeout(WAIT, client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_empty());

        assert!(
            tokio::time::timeout(Duration::from_millis(100), proxy.accept())
                .await
                .is_err()
        );

        handle.stop().await;
    }

    #[tokio::test]
    async fn http_host_port_goes_into_connect() {
        let (proxy, proxy_port) = fake_server().await;
        let config = loopback_config().with_proxy(ProxyConfig::upstream("127.0.0.1", proxy_port));
        let handle = start(config, Arc::new(NullResolver));

        let request = b"GET /status HTTP/1.1\r\nHost: foo.example.com:8080\r\nAccept: */*\r\n\r\n";
        let mut client = TcpStream::connect(handle.http_addr()).await.unwrap();
        client.write_all(request).await.unwrap();

        let (mut tunnel, _) = tokio::time::timeout(WAIT, proxy.accept())
            .await
            .unwrap()
            .unwrap();
        let head = String::from_utf8(read_head(&mut tunnel).await).unwrap();
        assert!(head.starts_with("CONNECT foo.example.com:8080 HTTP/1.1\r\n"));
        assert!(head.contains("X-Forwarded-For: 127.0.0.1\r\n"));
        assert!(head.contains("Forwarded: for=127.0.0.1\r\n"));

        // Response bytes that ride along with the 200 reach the client first.
        tunnel
            .write_all(b"HTTP/1.1 200 OK\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
            .await
            .unwrap();
        let early = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        assert_eq!(read_exactly(&mut client, early.len()).await, early);
        assert_eq!(read_exactly(&mut tunnel, request.len()).await, request);

        handle.stop().await;
    }
}
