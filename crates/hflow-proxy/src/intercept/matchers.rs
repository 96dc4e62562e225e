//! Stock matchers and the identity transform.

use super::{RequestMatcher, RequestTransform, ResponseMatcher, ResponseTransform};
use crate::message::{ProxyRequest, ProxyResponse};

/// Matches nothing. The default for every intercept.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverMatch;

impl RequestMatcher for NeverMatch {
    fn matches(&self, _request: &ProxyRequest) -> anyhow::Result<bool> {
        Ok(false)
    }
}

impl ResponseMatcher for NeverMatch {
    fn matches(&self, _request: &ProxyRequest, _response: &ProxyResponse) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Matches every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAllRequests;

impl RequestMatcher for MatchAllRequests {
    fn matches(&self, _request: &ProxyRequest) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Matches every response.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAllResponses;

impl ResponseMatcher for MatchAllResponses {
    fn matches(&self, _request: &ProxyRequest, _response: &ProxyResponse) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Leaves the message untouched. The default for every intercept.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl RequestTransform for Identity {
    fn apply(&self, _request: &mut ProxyRequest) -> anyhow::Result<()> {
        Ok(())
    }
}

impl ResponseTransform for Identity {
    fn apply(&self, _response: &mut ProxyResponse) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Matches requests whose URL contains a substring. See [`match_request_url`].
#[derive(Debug, Clone)]
pub struct UrlContains {
    substring: String,
}

impl RequestMatcher for UrlContains {
    fn matches(&self, request: &ProxyRequest) -> anyhow::Result<bool> {
        Ok(self.substring.is_empty() || request.url.as_str().contains(&self.substring))
    }
}

/// Returns a matcher for requests whose URL contains `substring`.
/// An empty substring matches every request.
pub fn match_request_url(substring: impl Into<String>) -> UrlContains {
    UrlContains {
        substring: substring.into(),
    }
}

/// Matches responses by status line, after their request matches.
/// See [`match_response_status`].
#[derive(Debug, Clone)]
pub struct StatusContains<M> {
    substring: String,
    request: M,
}

impl<M: RequestMatcher> ResponseMatcher for StatusContains<M> {
    fn matches(&self, request: &ProxyRequest, response: &ProxyResponse) -> anyhow::Result<bool> {
        if !self.request.matches(request)? {
            return Ok(false);
        }

        Ok(self.substring.is_empty() || response.status_line().contains(&self.substring))
    }
}

/// Returns a matcher for responses whose status line (e.g. `404 Not Found`)
/// contains `substring`, answering a request that `request_matcher` accepts.
///
/// The request matcher is consulted first and its error is returned as is.
/// An empty substring accepts any status.
pub fn match_response_status<M: RequestMatcher>(
    substring: impl Into<String>,
    request_matcher: M,
) -> StatusContains<M> {
    StatusContains {
        substring: substring.into(),
        request: request_matcher,
    }
}
