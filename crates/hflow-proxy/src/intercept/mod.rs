//! Intercepts: match/transform rules applied to every exchange.
//!
//! An [`Intercept`] pairs a request predicate with a request transform and a
//! response predicate with a response transform. Unset predicates never match
//! and unset transforms leave the message untouched, so an intercept only does
//! what it was explicitly given.
//!
//! Installed intercepts live in an [`InterceptRegistry`]; every exchange takes
//! a snapshot of it and runs that snapshot through the [`InterceptPipeline`].

pub mod capture;
mod matchers;
mod pipeline;
mod registry;
pub mod rules;

use std::fmt;
use std::sync::Arc;

use crate::message::{ProxyRequest, ProxyResponse};

pub use matchers::{
    match_request_url, match_response_status, Identity, MatchAllRequests, MatchAllResponses,
    NeverMatch, StatusContains, UrlContains,
};
pub use pipeline::InterceptPipeline;
pub use registry::{InterceptId, InterceptRegistry, InterceptSummary, Snapshot};

/// Decides whether an intercept applies to a request.
pub trait RequestMatcher: Send + Sync {
    /// Returns true when the request should be transformed.
    fn matches(&self, request: &ProxyRequest) -> anyhow::Result<bool>;
}

/// Decides whether an intercept applies to a response.
pub trait ResponseMatcher: Send + Sync {
    /// Returns true when the response should be transformed. `request` is the
    /// request the response answers.
    fn matches(&self, request: &ProxyRequest, response: &ProxyResponse) -> anyhow::Result<bool>;
}

/// Mutates a matched request.
pub trait RequestTransform: Send + Sync {
    /// Applies the transform in place.
    fn apply(&self, request: &mut ProxyRequest) -> anyhow::Result<()>;
}

/// Mutates a matched response. The body is always plaintext here.
pub trait ResponseTransform: Send + Sync {
    /// Applies the transform in place.
    fn apply(&self, response: &mut ProxyResponse) -> anyhow::Result<()>;
}

impl<F> RequestMatcher for F
where
    F: Fn(&ProxyRequest) -> anyhow::Result<bool> + Send + Sync,
{
    fn matches(&self, request: &ProxyRequest) -> anyhow::Result<bool> {
        self(request)
    }
}

impl<F> ResponseMatcher for F
where
    F: Fn(&ProxyRequest, &ProxyResponse) -> anyhow::Result<bool> + Send + Sync,
{
    fn matches(&self, request: &ProxyRequest, response: &ProxyResponse) -> anyhow::Result<bool> {
        self(request, response)
    }
}

impl<F> RequestTransform for F
where
    F: Fn(&mut ProxyRequest) -> anyhow::Result<()> + Send + Sync,
{
    fn apply(&self, request: &mut ProxyRequest) -> anyhow::Result<()> {
        self(request)
    }
}

impl<F> ResponseTransform for F
where
    F: Fn(&mut ProxyResponse) -> anyhow::Result<()> + Send + Sync,
{
    fn apply(&self, response: &mut ProxyResponse) -> anyhow::Result<()> {
        self(response)
    }
}

/// A labelled set of matchers and transforms.
///
/// Intercepts are immutable once built; cloning one shares its rules.
#[derive(Clone)]
pub struct Intercept {
    label: String,
    match_request: Arc<dyn RequestMatcher>,
    request: Arc<dyn RequestTransform>,
    match_response: Arc<dyn ResponseMatcher>,
    response: Arc<dyn ResponseTransform>,
}

impl fmt::Debug for Intercept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Intercept")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl Intercept {
    /// Creates an intercept that never matches anything.
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        tracing::trace!("creating intercept with label [{}]", label);

        Self {
            label,
            match_request: Arc::new(NeverMatch),
            request: Arc::new(Identity),
            match_response: Arc::new(NeverMatch),
            response: Arc::new(Identity),
        }
    }

    /// Sets the request matcher and transform.
    pub fn with_request(
        self,
        matcher: impl RequestMatcher + 'static,
        transform: impl RequestTransform + 'static,
    ) -> Self {
        self.with_request_matcher(matcher)
            .with_request_transform(transform)
    }

    /// Sets the response matcher and transform.
    pub fn with_response(
        self,
        matcher: impl ResponseMatcher + 'static,
        transform: impl ResponseTransform + 'static,
    ) -> Self {
        self.with_response_matcher(matcher)
            .with_response_transform(transform)
    }

    /// Sets the request matcher.
    pub fn with_request_matcher(mut self, matcher: impl RequestMatcher + 'static) -> Self {
        self.match_request = Arc::new(matcher);
        self
    }

    /// Sets the request transform.
    pub fn with_request_transform(mut self, transform: impl RequestTransform + 'static) -> Self {
        self.request = Arc::new(transform);
        self
    }

    /// Sets the response matcher.
    pub fn with_response_matcher(mut self, matcher: impl ResponseMatcher + 'static) -> Self {
        self.match_response = Arc::new(matcher);
        self
    }

    /// Sets the response transform.
    pub fn with_response_transform(mut self, transform: impl ResponseTransform + 'static) -> Self {
        self.response = Arc::new(transform);
        self
    }

    /// Descriptive label. Has no effect on behaviour.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn match_request(&self, request: &ProxyRequest) -> anyhow::Result<bool> {
        self.match_request.matches(request)
    }

    pub(crate) fn transform_request(&self, request: &mut ProxyRequest) -> anyhow::Result<()> {
        self.request.apply(request)
    }

    pub(crate) fn match_response(
        &self,
        request: &ProxyRequest,
        response: &ProxyResponse,
    ) -> anyhow::Result<bool> {
        self.match_response.matches(request, response)
    }

    pub(crate) fn transform_response(&self, response: &mut ProxyResponse) -> anyhow::Result<()> {
        self.response.apply(response)
    }
}
