//! Error types for the proxy.

use thiserror::Error;

/// Proxy error type.
///
/// Every variant is contained to the exchange that produced it: the handler
/// answers that exchange with `503 Service Unavailable` and logs the cause.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Certificate authority error.
    #[error("CA error: {0}")]
    Ca(#[from] CaError),

    /// Content-Encoding codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An intercept's matcher failed.
    #[error("error matching intercept [{label}] to [{target}]: {cause:#}")]
    InterceptMatch {
        /// Label of the failing intercept.
        label: String,
        /// URL of the exchange being matched.
        target: String,
        /// What the matcher returned.
        cause: anyhow::Error,
    },

    /// An intercept's transform failed.
    #[error("error applying intercept [{label}] to [{target}]: {cause:#}")]
    InterceptTransform {
        /// Label of the failing intercept.
        label: String,
        /// URL of the exchange being transformed.
        target: String,
        /// What the transform returned.
        cause: anyhow::Error,
    },

    /// An intercept rule could not be built.
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// The origin was unreachable or failed.
    #[error("upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    /// Failed to buffer a message body.
    #[error("body error: {0}")]
    Body(String),

    /// Failed to assemble an HTTP message.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),

    /// The request target could not be turned into an absolute URL.
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Certificate authority error type.
#[derive(Debug, Error)]
pub enum CaError {
    /// Root authority material is malformed, of the wrong type, or inconsistent.
    ///
    /// Raised only while loading the root; the process cannot serve HTTPS without it.
    #[error("invalid root authority material: {0}")]
    Material(String),

    /// Failed to generate a leaf certificate for one subject.
    #[error("unable to create certificate for [{subject}]: {message}")]
    Generation {
        /// Subject the certificate was requested for.
        subject: String,
        /// What failed.
        message: String,
    },

    /// Failed to determine the host's outbound IP address.
    #[error("unable to ascertain host ip: {0}")]
    HostIp(#[source] std::io::Error),
}

impl CaError {
    pub(crate) fn generation(subject: &str, message: impl std::fmt::Display) -> Self {
        Self::Generation {
            subject: subject.to_string(),
            message: message.to_string(),
        }
    }
}

/// Codec error type.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No codec is registered for the token.
    #[error("unsupported content-encoding [{0}]")]
    Unsupported(String),

    /// Decoding failed.
    #[error("unable to decode data with [{token}]: {cause}")]
    Decode {
        /// Content-Encoding token.
        token: String,
        /// Underlying failure.
        #[source]
        cause: std::io::Error,
    },

    /// Encoding failed.
    #[error("unable to encode data with [{token}]: {cause}")]
    Encode {
        /// Content-Encoding token.
        token: String,
        /// Underlying failure.
        #[source]
        cause: std::io::Error,
    },
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
