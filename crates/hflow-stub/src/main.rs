//! hflow-stub - echo origin for trying out hflow by hand.

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Context;
use clap::Parser;
use hflow_stub::{serve_http, serve_https, self_signed_config, DEFAULT_HTTP_PORT, DEFAULT_TLS_PORT};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Echo origin serving `/echo/` over HTTP and HTTPS
#[derive(Parser, Debug)]
#[command(name = "hflow-stub", version, about)]
struct Args {
    /// Plain HTTP port
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT)]
    port: u16,

    /// HTTPS port
    #[arg(long, default_value_t = DEFAULT_TLS_PORT)]
    tls: u16,

    /// Log verbosity (0-3)
    #[arg(short, long, default_value_t = 0)]
    verbosity: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbosity == 0 { "info" } else { "debug" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hflow_stub={},warn", level)));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = self_signed_config(vec!["localhost".into(), "127.0.0.1".into()])
        .context("failed to create TLS configuration")?;

    let http = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port)))
        .await
        .with_context(|| format!("failed to bind HTTP port {}", args.port))?;
    let https = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.tls)))
        .await
        .with_context(|| format!("failed to bind HTTPS port {}", args.tls))?;

    tokio::select! {
        res = serve_http(http) => res.context("HTTP listener failed")?,
        res = serve_https(https, config) => res.context("HTTPS listener failed")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("stub shutting down"),
    }

    Ok(())
}
