//! Disposable echo origin.
//!
//! `/echo/` answers with the raw query string and the request body:
//!
//! ```text
//! qs-data: <query>
//! body-data: <body>
//! ```
//!
//! Request headers named `x-*` are mirrored back as `x-echo-*`, and the body
//! is brotli-encoded when the client accepts `br`. Every response carries
//! `X-From: hflow-stub`; any other path is a `404`.

use std::convert::Infallible;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use hyper::http::request::Parts;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoConnBuilder;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Value of the `X-From` header on every stub response.
pub const X_FROM: &str = "hflow-stub";

/// Default plain HTTP port.
pub const DEFAULT_HTTP_PORT: u16 = 8081;

/// Default TLS port.
pub const DEFAULT_TLS_PORT: u16 = 4444;

const ECHO_PATH: &str = "/echo/";
const ECHO_PREFIX: &str = "x-echo-";

/// Builds a TLS configuration around a freshly generated self-signed
/// certificate for `names`.
pub fn self_signed_config(names: Vec<String>) -> anyhow::Result<Arc<ServerConfig>> {
    let rcgen::CertifiedKey { cert, signing_key } = rcgen::generate_simple_self_signed(names)?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));

    let mut config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(vec![cert.der().clone()], key)?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Serves plain HTTP on `listener` until accepting fails.
pub async fn serve_http(listener: TcpListener) -> std::io::Result<()> {
    tracing::info!("stub listening for HTTP on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(serve_connection(TokioIo::new(stream), peer));
    }
}

/// Serves HTTPS on `listener` until accepting fails.
pub async fn serve_https(listener: TcpListener, config: Arc<ServerConfig>) -> std::io::Result<()> {
    tracing::info!("stub listening for HTTPS on {}", listener.local_addr()?);
    let acceptor = TlsAcceptor::from(config);

    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls) => serve_connection(TokioIo::new(tls), peer).await,
                Err(e) => tracing::debug!("TLS handshake with {} failed: {}", peer, e),
            }
        });
    }
}

async fn serve_connection<I>(io: I, peer: SocketAddr)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    if let Err(e) = AutoConnBuilder::new(TokioExecutor::new())
        .serve_connection(io, service_fn(echo))
        .await
    {
        tracing::debug!("connection from {} ended with error: {}", peer, e);
    }
}

async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!("failed to read request body for [{}]: {}", parts.uri, e);
            return Ok(respond(StatusCode::BAD_REQUEST, Bytes::new()));
        }
    };

    Ok(reply(&parts, &body))
}

fn reply(parts: &Parts, body: &[u8]) -> Response<Full<Bytes>> {
    tracing::debug!("{} {}", parts.method, parts.uri);

    if parts.uri.path() != ECHO_PATH {
        return respond(StatusCode::NOT_FOUND, Bytes::new());
    }

    let text = format!(
        "qs-data: {}\nbody-data: {}\n",
        parts.uri.query().unwrap_or_default(),
        String::from_utf8_lossy(body)
    );

    let accepts_br = parts
        .headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("br"));

    let mut res = if accepts_br {
        match brotli_encode(text.as_bytes()) {
            Ok(encoded) => {
                let mut res = respond(StatusCode::OK, Bytes::from(encoded));
                res.headers_mut()
                    .insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
                res
            }
            Err(e) => {
                tracing::error!("brotli encoding failed: {}", e);
                return respond(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new());
            }
        }
    } else {
        respond(StatusCode::OK, Bytes::from(text))
    };

    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));

    for (name, value) in &parts.headers {
        let name = name.as_str();
        if !name.starts_with("x-") {
            continue;
        }
        if let Ok(echoed) = HeaderName::from_bytes(format!("{}{}", ECHO_PREFIX, &name[2..]).as_bytes()) {
            res.headers_mut().append(echoed, value.clone());
        }
    }

    res
}

fn respond(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut res = Response::new(Full::new(body));
    *res.status_mut() = status;
    res.headers_mut()
        .insert("x-from", HeaderValue::from_static(X_FROM));
    res
}

fn brotli_encode(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    brotli::CompressorReader::new(data, 4096, 5, 22).read_to_end(&mut out)?;
    Ok(out)
}
