//! HTTP and HTTPS listeners.
//!
//! The HTTP listener serves absolute-form proxy requests. The HTTPS listener
//! accepts `CONNECT`, terminates TLS inside the tunnel with a leaf certificate
//! for the client's server name, and serves the decrypted requests through the
//! same handler.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::http::uri::{Authority, Scheme};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoConnBuilder;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::LazyConfigAcceptor;

use crate::ca::{CertificateAuthority, SniResolver};
use crate::codec::CodecRegistry;
use crate::error::{ProxyError, Result};
use crate::handler::{build_client, service_unavailable, status_response, ProxyHandler};
use crate::intercept::{InterceptPipeline, InterceptRegistry};
use crate::{DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address of the HTTP listener.
    pub http_addr: SocketAddr,
    /// Address of the HTTPS (`CONNECT`) listener.
    pub https_addr: SocketAddr,
    /// Skip verification of origin certificates.
    pub accept_invalid_upstream_certs: bool,
    /// Connect timeout for origin connections.
    pub connect_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTP_PORT)),
            https_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTPS_PORT)),
            accept_invalid_upstream_certs: false,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ProxyConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds both listeners on `ip`, keeping their ports.
    pub fn with_bind(mut self, ip: IpAddr) -> Self {
        self.http_addr.set_ip(ip);
        self.https_addr.set_ip(ip);
        self
    }

    /// Sets the HTTP listener port.
    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_addr.set_port(port);
        self
    }

    /// Sets the HTTPS listener port.
    pub fn with_https_port(mut self, port: u16) -> Self {
        self.https_addr.set_port(port);
        self
    }

    /// Sets whether invalid origin certificates are accepted.
    pub fn with_accept_invalid_upstream_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_upstream_certs = accept;
        self
    }

    /// Sets the origin connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Loopback listeners on ephemeral ports.
    pub fn ephemeral() -> Self {
        Self::default()
            .with_bind(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_http_port(0)
            .with_https_port(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listener {
    Http,
    Https,
}

struct Shared {
    handler: ProxyHandler,
    ca: Arc<CertificateAuthority>,
    tls: Arc<ServerConfig>,
    builder: AutoConnBuilder<TokioExecutor>,
}

/// The intercepting proxy.
pub struct ProxyServer {
    config: ProxyConfig,
    ca: Arc<CertificateAuthority>,
    registry: Arc<InterceptRegistry>,
    codecs: CodecRegistry,
}

impl ProxyServer {
    /// Creates a server issuing certificates from `ca` and applying the
    /// intercepts installed in `registry`.
    pub fn new(
        config: ProxyConfig,
        ca: Arc<CertificateAuthority>,
        registry: Arc<InterceptRegistry>,
    ) -> Self {
        Self {
            config,
            ca,
            registry,
            codecs: CodecRegistry::with_defaults(),
        }
    }

    /// Replaces the content codecs used to normalize response bodies.
    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// The registry consulted for every exchange.
    pub fn registry(&self) -> &Arc<InterceptRegistry> {
        &self.registry
    }

    /// Binds both listeners and serves them in the background.
    pub async fn start(self) -> Result<ProxyHandle> {
        let client = build_client(
            self.config.accept_invalid_upstream_certs,
            self.config.connect_timeout,
        )?;
        let handler = ProxyHandler::new(client, self.registry, InterceptPipeline::new(self.codecs));

        let shared = Arc::new(Shared {
            handler,
            tls: tls_config(Arc::clone(&self.ca))?,
            ca: self.ca,
            builder: AutoConnBuilder::new(TokioExecutor::new()),
        });

        let http = TcpListener::bind(self.config.http_addr).await?;
        let https = TcpListener::bind(self.config.https_addr).await?;
        let http_addr = http.local_addr()?;
        let https_addr = https.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        tracing::info!("HTTP proxy listening on {}", http_addr);
        tracing::info!("HTTPS proxy listening on {}", https_addr);

        let handles = vec![
            tokio::spawn(serve(
                http,
                Listener::Http,
                Arc::clone(&shared),
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(serve(https, Listener::Https, shared, shutdown_tx.subscribe())),
        ];

        Ok(ProxyHandle {
            shutdown_tx,
            http_addr,
            https_addr,
            handles,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    http_addr: SocketAddr,
    https_addr: SocketAddr,
    handles: Vec<JoinHandle<()>>,
}

impl ProxyHandle {
    /// Address the HTTP listener is bound to.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Address the HTTPS listener is bound to.
    pub fn https_addr(&self) -> SocketAddr {
        self.https_addr
    }

    /// Signals both listeners to stop accepting connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for both listeners to finish.
    pub async fn wait(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    /// Shuts down the listeners and waits for them to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

fn tls_config(ca: Arc<CertificateAuthority>) -> Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ProxyError::Tls(e.to_string()))?
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(SniResolver::new(ca)));

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

async fn serve(
    listener: TcpListener,
    kind: Listener,
    shared: Arc<Shared>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("failed to accept connection: {}", e);
                    continue;
                }
            },
            _ = shutdown.recv() => break,
        };

        tracing::trace!("accepted {:?} connection from {}", kind, peer);

        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let builder = shared.builder.clone();
            let service = service_fn(move |req: Request<Incoming>| {
                let shared = Arc::clone(&shared);
                async move { Ok::<_, Infallible>(route(req, kind, shared).await) }
            });

            if let Err(e) = builder
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!("connection from {} ended with error: {}", peer, e);
            }
        });
    }

    tracing::info!("{:?} proxy listener stopped", kind);
}

async fn route(
    req: Request<Incoming>,
    kind: Listener,
    shared: Arc<Shared>,
) -> hyper::Response<http_body_util::Full<bytes::Bytes>> {
    if req.method() != Method::CONNECT {
        return shared.handler.handle(req).await;
    }

    if kind == Listener::Http {
        tracing::debug!("rejecting CONNECT to [{}] on the HTTP listener", req.uri());
        return status_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let Some(authority) = req.uri().authority().cloned() else {
        tracing::debug!("CONNECT without authority [{}]", req.uri());
        return status_response(StatusCode::BAD_REQUEST);
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = intercept_tunnel(upgraded, authority.clone(), shared).await {
                    tracing::error!("error in tunnel to [{}]: {}", authority, e);
                }
            }
            Err(e) => tracing::error!("upgrade error for [{}]: {}", authority, e),
        }
    });

    status_response(StatusCode::OK)
}

/// Terminates TLS on a `CONNECT` tunnel and serves the requests inside it.
async fn intercept_tunnel(upgraded: Upgraded, authority: Authority, shared: Arc<Shared>) -> Result<()> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), TokioIo::new(upgraded));
    let start = acceptor.await?;

    let server_name = start
        .client_hello()
        .server_name()
        .unwrap_or_default()
        .to_string();

    // Issue the leaf off the runtime; the resolver then finds it cached.
    let ca = Arc::clone(&shared.ca);
    let subject = server_name.clone();
    tokio::task::spawn_blocking(move || ca.leaf_certificate(&subject))
        .await
        .map_err(|e| ProxyError::Tls(format!("certificate task failed: {}", e)))??;

    let stream = start.into_stream(Arc::clone(&shared.tls)).await?;
    tracing::debug!("TLS established for [{}] (sni [{}])", authority, server_name);

    let builder = shared.builder.clone();
    let service = service_fn(move |mut req: Request<Incoming>| {
        let shared = Arc::clone(&shared);
        let authority = authority.clone();
        async move {
            if req.method() == Method::CONNECT {
                return Ok::<_, Infallible>(status_response(StatusCode::METHOD_NOT_ALLOWED));
            }

            match absolute_uri(&authority, req.uri()) {
                Ok(uri) => *req.uri_mut() = uri,
                Err(e) => {
                    tracing::error!("{}", e);
                    return Ok(service_unavailable());
                }
            }

            Ok(shared.handler.handle(req).await)
        }
    });

    builder
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
        .map_err(|e| ProxyError::Tls(format!("connection error: {}", e)))?;

    Ok(())
}

/// Rebuilds an origin-form tunnel request target as `https://<authority><path>`.
fn absolute_uri(authority: &Authority, uri: &Uri) -> Result<Uri> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }

    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    Uri::builder()
        .scheme(Scheme::HTTPS)
        .authority(authority.clone())
        .path_and_query(path)
        .build()
        .map_err(|e| ProxyError::InvalidUri(format!("{}{}: {}", authority, path, e)))
}
