//! Detached request/response snapshots.
//!
//! A [`ProxyRequest`] or [`ProxyResponse`] owns its fully buffered body and a
//! copy of the headers, so intercepts can mutate them freely without touching
//! the live connection. Nothing is written anywhere until the snapshot is
//! converted back into transport form.

use std::fmt;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Request, Response, StatusCode, Version};
use reqwest::Url;

use crate::codec::CodecRegistry;
use crate::error::{ProxyError, Result};

/// Value of the `Via` header stamped on every response that passes through.
pub const VIA: &str = "hflow";

/// Headers that describe a single connection and are never forwarded.
static HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// A buffered, detached snapshot of a request.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// Absolute URL of the request.
    pub url: Url,
    /// Request method.
    pub method: Method,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Bytes,
}

impl ProxyRequest {
    /// Creates an empty request.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            url,
            method,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Buffers `req` into a snapshot.
    ///
    /// The request target must already be in absolute form.
    pub async fn from_request<B>(req: Request<B>) -> Result<Self>
    where
        B: Body,
        B::Error: fmt::Display,
    {
        let (parts, body) = req.into_parts();

        let target = parts.uri.to_string();
        let url = Url::parse(&target)
            .map_err(|e| ProxyError::InvalidUri(format!("{}: {}", target, e)))?;

        let body = collect(body)
            .await
            .map_err(|e| ProxyError::Body(format!("unable to read request body: {}", e)))?;

        Ok(Self {
            url,
            method: parts.method,
            headers: parts.headers,
            body,
        })
    }

    /// Headers to send to the origin: the snapshot's headers without
    /// connection-scoped or framing headers.
    pub fn outbound_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        strip_connection_headers(&mut headers);
        headers.remove(header::HOST);
        headers
    }

    /// Builds the outbound call for this request on `client`.
    pub fn to_outbound(&self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let builder = client
            .request(self.method.clone(), self.url.clone())
            .headers(self.outbound_headers());

        if self.body.is_empty() {
            builder
        } else {
            builder.body(self.body.clone())
        }
    }
}

/// TLS details of the origin connection, when there was one.
#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    /// DER encoding of the origin's leaf certificate.
    pub peer_certificate: Option<Bytes>,
}

/// A buffered, detached snapshot of a response.
///
/// While a snapshot exists its body is plaintext whenever the
/// `Content-Encoding` header names a registered codec.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    /// Response status code.
    pub status: StatusCode,
    /// Protocol version the origin answered with.
    pub version: Version,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
    /// The request this response answers.
    pub request: ProxyRequest,
    /// Origin TLS details.
    pub tls: Option<TlsInfo>,
}

impl ProxyResponse {
    /// Creates an empty response to `request`.
    pub fn new(request: ProxyRequest, status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            request,
            tls: None,
        }
    }

    /// Buffers `res` into a snapshot, stamps `Via` and decodes the body.
    pub async fn from_response<B>(
        request: ProxyRequest,
        res: Response<B>,
        codecs: &CodecRegistry,
    ) -> Result<Self>
    where
        B: Body,
        B::Error: fmt::Display,
    {
        let (parts, body) = res.into_parts();

        let tls = parts
            .extensions
            .get::<reqwest::tls::TlsInfo>()
            .map(|info| TlsInfo {
                peer_certificate: info.peer_certificate().map(Bytes::copy_from_slice),
            });

        let mut body = collect(body)
            .await
            .map_err(|e| ProxyError::Body(format!("unable to read response body: {}", e)))?;

        let mut headers = parts.headers;
        headers.insert(header::VIA, HeaderValue::from_static(VIA));

        if let Some(token) = content_encoding(&headers).filter(|t| codecs.supported(t)) {
            if !body.is_empty() {
                tracing::debug!(
                    "decoding response body from [{}] using [{}]",
                    request.url,
                    token
                );
                body = codecs.decode(&token, &body)?.into();
            }
        }

        Ok(Self {
            status: parts.status,
            version: parts.version,
            headers,
            body,
            request,
            tls,
        })
    }

    /// Status line as `<code> <reason>`, e.g. `200 OK`.
    pub fn status_line(&self) -> String {
        match self.status.canonical_reason() {
            Some(reason) => format!("{} {}", self.status.as_u16(), reason),
            None => self.status.as_u16().to_string(),
        }
    }

    /// Converts the snapshot back into transport form, re-encoding the body
    /// with whatever `Content-Encoding` is now present.
    pub fn into_response(self, codecs: &CodecRegistry) -> Result<Response<Full<Bytes>>> {
        let mut body = self.body;

        if let Some(token) = content_encoding(&self.headers).filter(|t| codecs.supported(t)) {
            if !body.is_empty() {
                tracing::debug!(
                    "encoding response body for [{}] using [{}]",
                    self.request.url,
                    token
                );
                body = codecs.encode(&token, &body)?.into();
            }
        }

        let mut headers = self.headers;
        strip_connection_headers(&mut headers);

        let mut res = Response::builder().status(self.status).body(Full::new(body))?;
        *res.headers_mut() = headers;

        Ok(res)
    }
}

/// Returns the `Content-Encoding` token, if the header is present and readable.
pub fn content_encoding(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Removes hop-by-hop headers, any header named by `Connection`, and
/// `Content-Length`.
pub(crate) fn strip_connection_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }

    headers.remove(header::CONTENT_LENGTH);
}

async fn collect<B>(body: B) -> std::result::Result<Bytes, B::Error>
where
    B: Body,
{
    Ok(body.collect().await?.to_bytes())
}
