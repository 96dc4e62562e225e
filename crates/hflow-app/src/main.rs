//! hflow - intercepting HTTP/HTTPS proxy.
//!
//! Runs the proxy listeners with a single capture intercept that writes every
//! matching request and response to standard output, and optionally the
//! admin API for installing further intercepts at runtime.

use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use hflow_proxy::intercept::{capture, match_request_url, match_response_status};
use hflow_proxy::{
    CaptureOptions, CaptureSink, CertificateAuthority, InterceptId, InterceptRegistry,
    ProxyConfig, ProxyServer, SinkWorker, SyncWriter, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT,
};
use hflow_server::{AdminConfig, AdminServer, AdminState};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long shutdown waits for queued capture records to be written.
const CAPTURE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// hflow - intercepting HTTP/HTTPS proxy
#[derive(Parser, Debug)]
#[command(name = "hflow", version, about)]
struct Args {
    /// HTTP proxy port
    #[arg(short, long, default_value_t = DEFAULT_HTTP_PORT)]
    port: u16,

    /// HTTPS proxy port
    #[arg(long = "ps", default_value_t = DEFAULT_HTTPS_PORT)]
    https_port: u16,

    /// Write the root certificate in PEM form to stdout and exit
    #[arg(long)]
    ca: bool,

    /// Only capture requests whose URL contains this substring
    #[arg(short, long, default_value = "")]
    url: String,

    /// Only capture responses whose status line contains this substring
    #[arg(short, long, default_value = "")]
    status: String,

    /// Capture non-text bodies verbatim
    #[arg(short, long)]
    binary: bool,

    /// Truncate captured bodies to this many bytes (-1 for unlimited)
    #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
    limit: i64,

    /// Log verbosity (0-3)
    #[arg(short, long, default_value_t = 0)]
    verbosity: u8,

    /// Serve the admin API on 127.0.0.1 at this port
    #[arg(short, long)]
    admin_port: Option<u16>,

    /// Skip verification of origin certificates
    #[arg(short = 'k', long)]
    insecure: bool,

    /// Address to bind the proxy listeners to
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Also write logs to daily rolling files in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn log_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Initialize logging to stderr, plus rolling files when a directory is given.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = log_level(args.verbosity);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "hflow={0},hflow_proxy={0},hflow_server={0},warn",
            level
        ))
    });

    if let Some(dir) = args.log_dir.as_deref() {
        match file_appender(dir) {
            Ok(appender) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", dir);
                return Some(guard);
            }
            Err(e) => {
                tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .with_writer(io::stderr)
                    .init();
                tracing::warn!("File logging unavailable, using stderr only: {:#}", e);
                return None;
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .init();
    None
}

fn file_appender(dir: &Path) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {:?}", dir))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(5)
        .filename_prefix("hflow")
        .filename_suffix("log")
        .build(dir)
        .context("failed to create log file appender")
}

fn capture_options(args: &Args) -> CaptureOptions {
    CaptureOptions::default()
        .with_binary(args.binary)
        .with_limit(args.limit)
}

fn proxy_config(args: &Args) -> ProxyConfig {
    ProxyConfig::new()
        .with_bind(args.bind)
        .with_http_port(args.port)
        .with_https_port(args.https_port)
        .with_accept_invalid_upstream_certs(args.insecure)
}

/// Removes the capture intercept and waits for its queued records to be written.
///
/// The registry entry holds the last sink handle outside in-flight exchanges,
/// so removing it lets the worker drain and exit.
async fn finish_capture(registry: &InterceptRegistry, id: InterceptId, worker: SinkWorker) {
    registry.remove(id);

    // A detached thread, so a wedged sink cannot hold up process exit.
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    std::thread::spawn(move || {
        worker.join();
        let _ = done_tx.send(());
    });

    match tokio::time::timeout(CAPTURE_DRAIN_TIMEOUT, done_rx).await {
        Ok(_) => tracing::debug!("capture output flushed"),
        Err(_) => tracing::warn!("capture output not flushed within {:?}", CAPTURE_DRAIN_TIMEOUT),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_logging(&args);

    let ca = Arc::new(
        CertificateAuthority::from_embedded().context("failed to load root authority")?,
    );

    if args.ca {
        let mut stdout = io::stdout().lock();
        ca.write_root_certificate(&mut stdout)
            .and_then(|_| stdout.flush())
            .context("failed to write root certificate")?;
        return Ok(());
    }

    tracing::info!("Starting hflow...");
    tracing::debug!("Args: {:?}", args);

    let registry = Arc::new(InterceptRegistry::new());

    let (sink, sink_worker) =
        CaptureSink::spawn(SyncWriter::new(io::stdout())).context("failed to start capture sink")?;
    let id = registry.add(capture::writer(
        "capture",
        match_request_url(args.url.clone()),
        match_response_status(args.status.clone(), match_request_url(args.url.clone())),
        capture_options(&args),
        sink,
    ));
    tracing::debug!("installed capture intercept {}", id);

    let handle = ProxyServer::new(proxy_config(&args), Arc::clone(&ca), Arc::clone(&registry))
        .start()
        .await
        .context("failed to start proxy")?;

    let admin = match args.admin_port {
        Some(port) => {
            let server = AdminServer::new(
                AdminConfig::default().with_port(port),
                AdminState::new(Arc::clone(&registry), Arc::clone(&ca)),
            )?;

            Some(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    tracing::error!("Admin server error: {}", e);
                }
            }))
        }
        None => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("hflow shutting down");
    handle.stop().await;
    if let Some(admin) = admin {
        admin.abort();
    }
    finish_capture(&registry, id, sink_worker).await;
    Ok(())
}
