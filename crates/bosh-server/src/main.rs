//! bosh-server: HTTP binding server.
//!
//! Lets clients that cannot keep a socket open exchange stanzas over a
//! sequence of long-polled HTTP requests.

use bosh_server::config::{CliOverrides, ServerConfig};
use bosh_server::router::LoopbackRouter;
use bosh_server::server::BoshServer;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// bosh-server: HTTP binding server
#[derive(Parser, Debug)]
#[command(name = "bosh-server", version, about = "HTTP binding (long-poll) server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.bosh/config.toml")]
    config: String,

    /// Server domain stanzas are routed for
    #[arg(long)]
    domain: Option<String>,

    /// Seconds a session may have no bound request before it is closed
    #[arg(long)]
    inactivity_timeout: Option<u64>,

    /// Simultaneous requests a client may have outstanding
    #[arg(long)]
    max_requests: Option<u32>,

    /// Minimum seconds between polls when the client holds nothing
    #[arg(long)]
    polling_interval: Option<u64>,

    /// Longest `wait` a client may negotiate, in seconds
    #[arg(long)]
    max_wait: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        CliOverrides {
            port: cli.port,
            domain: cli.domain,
            inactivity_timeout: cli.inactivity_timeout,
            max_requests: cli.max_requests,
            polling_interval: cli.polling_interval,
            max_wait: cli.max_wait,
        },
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = server_config.port,
        inactivity_timeout = server_config.bind.inactivity_timeout,
        max_requests = server_config.bind.max_requests,
        polling_interval = server_config.bind.polling_interval,
        max_wait = server_config.bind.max_wait,
        "starting bosh-server"
    );

    let router = Arc::new(LoopbackRouter::new(server_config.domain.clone()));
    let bosh_server = match BoshServer::new(server_config, router) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    // Run until shutdown signal
    tokio::select! {
        result = bosh_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                bosh_server.sessions().shutdown();
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    bosh_server.sessions().shutdown();
    info!("bosh-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
