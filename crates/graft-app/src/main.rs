//! Graft - HTTP/HTTPS forward proxy that grafts an HTML fragment into pages.
//!
//! Reads configuration from flags and environment variables, sets up
//! logging, runs the proxy until Ctrl-C (or SIGTERM) and shuts it down.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use graft_core::{DomainSet, DEFAULT_INJECT_HTML, DEFAULT_MAX_DECODED_BODY};
use graft_proxy::{ProxyConfig, ProxyServer, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_PROXY_PORT};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Graft - injecting HTTP/HTTPS forward proxy
#[derive(Parser, Debug)]
#[command(name = "graft", version, about)]
struct Args {
    /// Port to listen on (127.0.0.1)
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PROXY_PORT)]
    port: u16,

    /// Full listen address; overrides --port
    #[arg(long, env = "GRAFT_LISTEN")]
    listen: Option<SocketAddr>,

    /// Hosts whose HTML is injected, comma-separated (empty = all)
    #[arg(long, env = "INJECT_DOMAINS", default_value = "")]
    inject_domains: String,

    /// Hosts whose HTTPS tunnels are intercepted, comma-separated (empty = none)
    #[arg(long, env = "INTERCEPT_DOMAINS", default_value = "")]
    intercept_domains: String,

    /// HTML fragment inserted before </body>
    #[arg(long, env = "INJECT_HTML")]
    inject_html: Option<String>,

    /// Inline script body injected with a CSP nonce
    #[arg(long, env = "INJECT_SCRIPT", default_value = "")]
    inject_script: String,

    /// Directory for the root CA and issued certificates
    #[arg(long, env = "GRAFT_CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// Extra PEM root certificates trusted for upstream TLS
    #[arg(long, env = "GRAFT_UPSTREAM_CA")]
    upstream_ca: Option<PathBuf>,

    /// Largest response body (bytes) buffered for rewriting
    #[arg(long, env = "GRAFT_MAX_BODY", default_value_t = DEFAULT_MAX_DECODED_BODY)]
    max_body: usize,

    /// Upstream connect timeout in seconds
    #[arg(long, env = "GRAFT_CONNECT_TIMEOUT", default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout: u64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn proxy_config(&self) -> ProxyConfig {
        let addr = self
            .listen
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], self.port)));

        let mut config = ProxyConfig::default()
            .with_addr(addr)
            .with_inject_domains(DomainSet::parse_list(&self.inject_domains))
            .with_intercept_domains(DomainSet::parse_list(&self.intercept_domains))
            .with_inject_html(self.inject_html.as_deref().unwrap_or(DEFAULT_INJECT_HTML))
            .with_inject_script(self.inject_script.as_str())
            .with_max_buffered_body(self.max_body)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout));

        if let Some(dir) = &self.cert_dir {
            config = config.with_cert_dir(dir);
        }
        if let Some(path) = &self.upstream_ca {
            config = config.with_upstream_ca_file(path);
        }
        config
    }
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "graft", "Graft").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "graft={0},graft_core={0},graft_proxy={0},warn",
            log_level
        ))
    });

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("graft")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Resolves when the process is asked to stop.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    tracing::info!("Graft v{} starting", env!("CARGO_PKG_VERSION"));

    let config = args.proxy_config();
    let server = ProxyServer::new(config).context("invalid proxy configuration")?;
    if server.intercepts() {
        tracing::info!(
            "Install {:?} as a trusted root to browse intercepted hosts",
            server.ca_cert_path()
        );
    }

    let handle = server.start().await.context("failed to start proxy")?;
    tracing::info!("Proxy listening on {}", handle.addr());

    shutdown_signal().await;
    tracing::info!("Shutting down...");
    handle.stop().await;
    tracing::info!("Graft stopped");

    Ok(())
}
