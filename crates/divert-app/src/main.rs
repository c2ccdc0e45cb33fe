//! divert - transparent HTTP/HTTPS interception proxy.
//!
//! Listens for connections that NAT rules redirected away from ports 443 and
//! 80 and forwards each one to the host the client asked for, directly or
//! through an upstream forward proxy.
//!
//! A typical redirect setup:
//!
//! ```text
//! iptables -t nat -A OUTPUT -p tcp --dport 443 -m owner ! --uid-owner divert -j REDIRECT --to-ports 3130
//! iptables -t nat -A OUTPUT -p tcp --dport 80  -m owner ! --uid-owner divert -j REDIRECT --to-ports 3131
//! ```

mod cli;
mod logging;

use anyhow::Context;
use clap::Parser;
use divert_core::Config;
use divert_proxy::ProxyServer;
use tracing::{info, warn};

use crate::cli::Args;

/// Logs the effective configuration once at startup.
fn log_startup(config: &Config) {
    let upstream = config
        .proxy
        .upstream
        .as_ref()
        .map_or_else(|| "none (direct only)".to_string(), ToString::to_string);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen.host,
        https_port = config.listen.https_port,
        http_port = config.listen.http_port,
        upstream_proxy = %upstream,
        no_proxy = ?config.rules.no_proxy(),
        proxy_only = ?config.rules.proxy_only(),
        strict_domains = config.rules.label_boundary(),
        "starting divert"
    );

    if !config.listen.host.is_loopback() {
        warn!(
            listen = %config.listen.host,
            "not listening on a loopback address, the proxy may be reachable from other hosts"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C"),
        () = terminate => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init_logging(&args);

    let config = args.to_config().context("invalid configuration")?;
    log_startup(&config);

    let server = ProxyServer::bind(config).context("failed to start listeners")?;
    let handle = server.start();
    info!(
        https = %handle.https_addr(),
        http = %handle.http_addr(),
        "ready for redirected connections"
    );

    shutdown_signal().await;

    handle.stop().await;
    info!("divert stopped");
    Ok(())
}
