//! hflow proxy - an intercepting HTTP/HTTPS proxy.
//!
//! Every exchange that passes through the proxy is captured as a detached
//! request/response snapshot and run through a set of user-installed
//! intercepts that may observe or rewrite it before it is forwarded.
//!
//! ## Features
//!
//! - Plain HTTP proxying of absolute-form requests
//! - HTTPS interception of `CONNECT` tunnels with leaf certificates issued on
//!   the fly by an embedded root authority
//! - A runtime-mutable intercept registry with snapshot semantics
//! - Transparent `Content-Encoding` normalization, so intercepts always see
//!   plaintext response bodies
//! - A capture intercept that renders traffic as text records
//!
//! ## Architecture
//!
//! ```text
//! Client → Listener ─┬─ HTTP ──────────────────────────────┐
//!                    └─ CONNECT → TLS (leaf from CA) ──────┤
//!                                                          ▼
//!                           ProxyRequest ← request phase ← snapshot
//!                                │
//!                                ▼
//!                             Origin
//!                                │
//!                                ▼
//!            ProxyResponse (decoded) → response phase → re-encoded → Client
//! ```

pub mod ca;
pub mod codec;
mod error;
mod handler;
pub mod intercept;
mod message;
mod proxy;
pub mod sink;

pub use ca::{CertificateAuthority, SniResolver};
pub use codec::{CodecRegistry, ContentCodec};
pub use error::{CaError, CodecError, ProxyError, Result};
pub use handler::{build_client, ProxyHandler, Stage};
pub use intercept::capture::CaptureOptions;
pub use intercept::rules::HeaderRule;
pub use intercept::{
    Intercept, InterceptId, InterceptPipeline, InterceptRegistry, InterceptSummary,
    RequestMatcher, RequestTransform, ResponseMatcher, ResponseTransform, Snapshot,
};
pub use message::{content_encoding, ProxyRequest, ProxyResponse, TlsInfo, VIA};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use sink::{CaptureSink, SinkWorker, SyncWriter};

/// Default HTTP proxy port.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default HTTPS proxy port.
pub const DEFAULT_HTTPS_PORT: u16 = 4443;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_are_correct() {
        assert_eq!(DEFAULT_HTTP_PORT, 8080);
        assert_eq!(DEFAULT_HTTPS_PORT, 4443);
    }
}
