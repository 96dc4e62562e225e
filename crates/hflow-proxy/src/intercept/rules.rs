//! Declarative header rules.
//!
//! A [`HeaderRule`] is the serializable form of a common intercept: add fixed
//! headers to requests whose URL contains a substring and to their responses.

use std::collections::BTreeMap;

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use super::{match_request_url, match_response_status, Intercept};
use crate::error::{ProxyError, Result};
use crate::message::{ProxyRequest, ProxyResponse};

/// Adds headers to matching requests and responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRule {
    /// Intercept label.
    pub label: String,
    /// URL substring the request must contain. Empty matches all.
    #[serde(default)]
    pub url: String,
    /// Status line substring the response must contain. Empty matches all.
    #[serde(default)]
    pub status: String,
    /// Headers set on matching requests.
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    /// Headers set on matching responses.
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,
}

impl HeaderRule {
    /// Creates a rule matching every URL and status.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    /// Restricts the rule to URLs containing `url`.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Restricts the response half to status lines containing `status`.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Adds a header to set on requests.
    pub fn with_request_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.insert(name.into(), value.into());
        self
    }

    /// Adds a header to set on responses.
    pub fn with_response_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.response_headers.insert(name.into(), value.into());
        self
    }

    /// Validates the rule and builds the intercept.
    pub fn into_intercept(self) -> Result<Intercept> {
        if self.label.trim().is_empty() {
            return Err(ProxyError::InvalidRule("label must not be empty".into()));
        }

        let request_headers = parse_headers(&self.request_headers)?;
        let response_headers = parse_headers(&self.response_headers)?;

        let mut intercept = Intercept::new(self.label);

        if !request_headers.is_empty() {
            intercept = intercept.with_request(
                match_request_url(self.url.clone()),
                move |r: &mut ProxyRequest| -> anyhow::Result<()> {
                    extend(&mut r.headers, &request_headers);
                    Ok(())
                },
            );
        }

        if !response_headers.is_empty() {
            intercept = intercept.with_response(
                match_response_status(self.status, match_request_url(self.url)),
                move |r: &mut ProxyResponse| -> anyhow::Result<()> {
                    extend(&mut r.headers, &response_headers);
                    Ok(())
                },
            );
        }

        Ok(intercept)
    }
}

fn parse_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut parsed = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProxyError::InvalidRule(format!("header name [{}]: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ProxyError::InvalidRule(format!("header value for [{}]: {}", name, e)))?;
        parsed.insert(name, value);
    }

    Ok(parsed)
}

fn extend(target: &mut HeaderMap, headers: &HeaderMap) {
    for (name, value) in headers {
        target.insert(name.clone(), value.clone());
    }
}
