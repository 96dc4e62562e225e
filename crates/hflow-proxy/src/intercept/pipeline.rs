//! Runs a registry snapshot over one exchange.

use std::fmt;
use std::sync::Arc;

use hyper::body::Body;
use hyper::{Request, Response};

use super::Snapshot;
use crate::codec::CodecRegistry;
use crate::error::{ProxyError, Result};
use crate::message::{ProxyRequest, ProxyResponse};

/// Applies intercepts to the request and response of an exchange.
///
/// Every matching intercept in the snapshot is applied to the same message,
/// so later intercepts see earlier mutations. The first matcher or transform
/// error aborts the pass; changes already made are not rolled back.
/// The order intercepts are visited in is not part of the contract.
#[derive(Debug, Clone)]
pub struct InterceptPipeline {
    codecs: Arc<CodecRegistry>,
}

impl Default for InterceptPipeline {
    fn default() -> Self {
        Self::new(CodecRegistry::with_defaults())
    }
}

impl InterceptPipeline {
    /// Creates a pipeline that normalizes bodies with `codecs`.
    pub fn new(codecs: CodecRegistry) -> Self {
        Self {
            codecs: Arc::new(codecs),
        }
    }

    /// The codecs used to decode and re-encode response bodies.
    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Buffers `req` into a snapshot and runs the request phase over it.
    pub async fn apply_to_request<B>(&self, req: Request<B>, intercepts: &Snapshot) -> Result<ProxyRequest>
    where
        B: Body,
        B::Error: fmt::Display,
    {
        let mut request = ProxyRequest::from_request(req).await?;
        self.intercept_request(&mut request, intercepts)?;
        Ok(request)
    }

    /// Buffers `res` into a decoded snapshot and runs the response phase over it.
    pub async fn apply_to_response<B>(
        &self,
        request: &ProxyRequest,
        res: Response<B>,
        intercepts: &Snapshot,
    ) -> Result<ProxyResponse>
    where
        B: Body,
        B::Error: fmt::Display,
    {
        let mut response = ProxyResponse::from_response(request.clone(), res, &self.codecs).await?;
        self.intercept_response(&mut response, intercepts)?;
        Ok(response)
    }

    /// Runs the request phase over an existing snapshot.
    pub fn intercept_request(&self, request: &mut ProxyRequest, intercepts: &Snapshot) -> Result<()> {
        tracing::trace!("intercepting request for [{}]", request.url);

        for intercept in intercepts.values() {
            let matched = intercept
                .match_request(request)
                .map_err(|cause| ProxyError::InterceptMatch {
                    label: intercept.label().to_string(),
                    target: request.url.to_string(),
                    cause,
                })?;

            if !matched {
                continue;
            }

            tracing::debug!(
                "applying intercept [{}] to request for [{}]",
                intercept.label(),
                request.url
            );

            intercept
                .transform_request(request)
                .map_err(|cause| ProxyError::InterceptTransform {
                    label: intercept.label().to_string(),
                    target: request.url.to_string(),
                    cause,
                })?;
        }

        Ok(())
    }

    /// Runs the response phase over an existing snapshot. Matchers receive
    /// `response.request` as the originating request.
    pub fn intercept_response(&self, response: &mut ProxyResponse, intercepts: &Snapshot) -> Result<()> {
        tracing::trace!("intercepting response to [{}]", response.request.url);

        for intercept in intercepts.values() {
            let matched = intercept
                .match_response(&response.request, response)
                .map_err(|cause| ProxyError::InterceptMatch {
                    label: intercept.label().to_string(),
                    target: response.request.url.to_string(),
                    cause,
                })?;

            if !matched {
                continue;
            }

            tracing::debug!(
                "applying intercept [{}] to response to [{}]",
                intercept.label(),
                response.request.url
            );

            intercept
                .transform_response(response)
                .map_err(|cause| ProxyError::InterceptTransform {
                    label: intercept.label().to_string(),
                    target: response.request.url.to_string(),
                    cause,
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::{
        match_request_url, Intercept, InterceptRegistry, MatchAllRequests, MatchAllResponses,
    };
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::header::{HeaderValue, CONTENT_ENCODING};
    use hyper::{Method, StatusCode};
    use reqwest::Url;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn raw_request(url: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(url)
            .body(Full::new(Bytes::from_static(b"hello")))
            .unwrap()
    }

    fn counting_header(name: &'static str, calls: Arc<AtomicUsize>) -> Intercept {
        Intercept::new(name).with_request(MatchAllRequests, move |r: &mut ProxyRequest| -> anyhow::Result<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            r.headers.append(name, HeaderValue::from_static("1"));
            Ok(())
        })
    }

    #[tokio::test]
    async fn never_matching_intercept_changes_nothing() {
        let registry = InterceptRegistry::new();
        registry.add(Intercept::new("never").with_request_transform(|r: &mut ProxyRequest| -> anyhow::Result<()> {
            r.body = Bytes::from_static(b"changed");
            Ok(())
        }));

        let pipeline = InterceptPipeline::default();
        let request = pipeline
            .apply_to_request(raw_request("http://a.test/echo/"), &registry.snapshot())
            .await
            .unwrap();

        assert_eq!(request.body, Bytes::from_static(b"hello"));
        assert!(request.headers.is_empty());
    }

    #[tokio::test]
    async fn always_matching_intercept_applies_once_per_pass() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = InterceptRegistry::new();
        registry.add(counting_header("x-once", Arc::clone(&calls)));

        let pipeline = InterceptPipeline::default();
        let snapshot = registry.snapshot();

        let first = pipeline
            .apply_to_request(raw_request("http://a.test/"), &snapshot)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.headers.get_all("x-once").iter().count(), 1);

        pipeline
            .apply_to_request(raw_request("http://a.test/"), &snapshot)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn later_intercepts_see_earlier_mutations() {
        let registry = InterceptRegistry::new();
        registry.add(Intercept::new("rewrite").with_request(MatchAllRequests, |r: &mut ProxyRequest| -> anyhow::Result<()> {
            r.url = Url::parse("http://rewritten.test/target")?;
            Ok(())
        }));
        registry.add(Intercept::new("mark").with_request(
            match_request_url("rewritten.test"),
            |r: &mut ProxyRequest| -> anyhow::Result<()> {
                r.headers.insert("x-seen", HeaderValue::from_static("yes"));
                Ok(())
            },
        ));

        let mut request = ProxyRequest::new(Method::GET, Url::parse("http://a.test/").unwrap());
        InterceptPipeline::default()
            .intercept_request(&mut request, &registry.snapshot())
            .unwrap();

        assert_eq!(request.headers["x-seen"], "yes");
    }

    #[test]
    fn matcher_error_aborts_pass() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = InterceptRegistry::new();
        registry.add(Intercept::new("broken").with_request_matcher(|_: &ProxyRequest| -> anyhow::Result<bool> {
            anyhow::bail!("cannot decide")
        }));
        registry.add(counting_header("x-after", Arc::clone(&calls)));

        let mut request = ProxyRequest::new(Method::GET, Url::parse("http://a.test/").unwrap());
        let err = InterceptPipeline::default()
            .intercept_request(&mut request, &registry.snapshot())
            .unwrap_err();

        match err {
            ProxyError::InterceptMatch { label, target, .. } => {
                assert_eq!(label, "broken");
                assert_eq!(target, "http://a.test/");
            }
            other => panic!("unexpected error: {other}"),
        }
        // "broken" has the lower id, so it is visited first and stops the pass
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn transform_error_is_labelled() {
        let registry = InterceptRegistry::new();
        registry.add(Intercept::new("fails").with_response(MatchAllResponses, |_: &mut ProxyResponse| -> anyhow::Result<()> {
            anyhow::bail!("no thanks")
        }));

        let request = ProxyRequest::new(Method::GET, Url::parse("http://a.test/").unwrap());
        let mut response = ProxyResponse::new(request, StatusCode::OK);
        let err = InterceptPipeline::default()
            .intercept_response(&mut response, &registry.snapshot())
            .unwrap_err();

        assert!(matches!(err, ProxyError::InterceptTransform { ref label, .. } if label == "fails"));
        assert!(err.to_string().contains("no thanks"));
    }

    #[test]
    fn removal_does_not_affect_snapshot_in_use() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = InterceptRegistry::new();
        let id = registry.add(counting_header("x-removed", Arc::clone(&calls)));

        let in_flight = registry.snapshot();
        registry.remove(id);

        let pipeline = InterceptPipeline::default();
        let mut request = ProxyRequest::new(Method::GET, Url::parse("http://a.test/").unwrap());
        pipeline.intercept_request(&mut request, &in_flight).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut request = ProxyRequest::new(Method::GET, Url::parse("http://a.test/").unwrap());
        pipeline
            .intercept_request(&mut request, &registry.snapshot())
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!request.headers.contains_key("x-removed"));
    }

    #[tokio::test]
    async fn response_transforms_see_plaintext_and_output_is_reencoded() {
        let pipeline = InterceptPipeline::default();
        let compressed = pipeline.codecs().encode("br", b"origin text").unwrap();

        let registry = InterceptRegistry::new();
        registry.add(Intercept::new("append").with_response(
            MatchAllResponses,
            |r: &mut ProxyResponse| -> anyhow::Result<()> {
                anyhow::ensure!(r.body == "origin text", "body was not decoded");
                let mut body = r.body.to_vec();
                body.extend_from_slice(b" and more");
                r.body = body.into();
                Ok(())
            },
        ));

        let request = ProxyRequest::new(Method::GET, Url::parse("http://a.test/").unwrap());
        let raw = Response::builder()
            .header(CONTENT_ENCODING, "br")
            .body(Full::new(Bytes::from(compressed)))
            .unwrap();

        let response = pipeline
            .apply_to_response(&request, raw, &registry.snapshot())
            .await
            .unwrap();
        assert_eq!(response.body, "origin text and more");

        let wire = response
            .into_response(pipeline.codecs())
            .unwrap()
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes();

        assert_eq!(
            pipeline.codecs().decode("br", &wire).unwrap(),
            b"origin text and more"
        );
    }
}
