//! The capture intercept: renders matched traffic as text records.
//!
//! Request records open with `>>> <METHOD> <URL>`, response records with
//! `<<< <STATUS> from <METHOD> <URL>`. Headers follow one per line, then the
//! body (if any), then a delimiter line.

use std::borrow::Cow;
use std::fmt::Write as _;

use hyper::header::{self, HeaderMap};

use super::{Intercept, RequestMatcher, ResponseMatcher};
use crate::message::{ProxyRequest, ProxyResponse};
use crate::sink::CaptureSink;

/// Substrings that mark a content type as text.
const TEXT_CONTENT_TYPES: [&str; 5] = ["text/", "/json", "xml", "/javascript", "urlencoded"];

/// Stand-in for bodies that are not rendered.
pub const BINARY_PLACEHOLDER: &str = "[binary data]";

const DELIMITER_WIDTH: usize = 106;

/// How bodies are rendered in capture records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Render non-text bodies instead of [`BINARY_PLACEHOLDER`].
    pub binary: bool,
    /// Truncate bodies to this many bytes. `None` is unlimited.
    pub limit: Option<usize>,
}

impl CaptureOptions {
    /// Renders non-text bodies too.
    pub fn with_binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    /// Sets the body limit. Negative values mean unlimited.
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = usize::try_from(limit).ok();
        self
    }
}

/// Builds an intercept that submits a record to `sink` for every request
/// `request_matcher` accepts and every response `response_matcher` accepts.
///
/// The intercept never modifies traffic and never waits for the sink.
pub fn writer(
    label: impl Into<String>,
    request_matcher: impl RequestMatcher + 'static,
    response_matcher: impl ResponseMatcher + 'static,
    options: CaptureOptions,
    sink: CaptureSink,
) -> Intercept {
    let response_sink = sink.clone();

    Intercept::new(label)
        .with_request(request_matcher, move |r: &mut ProxyRequest| -> anyhow::Result<()> {
            sink.submit(render_request(r, &options));
            Ok(())
        })
        .with_response(response_matcher, move |r: &mut ProxyResponse| -> anyhow::Result<()> {
            response_sink.submit(render_response(r, &options));
            Ok(())
        })
}

/// Renders the record for a request.
pub fn render_request(request: &ProxyRequest, options: &CaptureOptions) -> String {
    let mut record = format!(">>> {} {}\n\n", request.method, request.url);
    render_message(&mut record, &request.headers, &request.body, options);
    record
}

/// Renders the record for a response.
pub fn render_response(response: &ProxyResponse, options: &CaptureOptions) -> String {
    let mut record = format!(
        "<<< {} from {} {}\n\n",
        response.status_line(),
        response.request.method,
        response.request.url
    );
    render_message(&mut record, &response.headers, &response.body, options);
    record
}

fn render_message(record: &mut String, headers: &HeaderMap, body: &[u8], options: &CaptureOptions) {
    for name in headers.keys() {
        let values: Vec<Cow<'_, str>> = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()))
            .collect();

        let _ = writeln!(record, "{}: {}", canonical_name(name.as_str()), values.join(","));
    }

    let body = match options.limit {
        Some(limit) if body.len() > limit => &body[..limit],
        _ => body,
    };

    let rendered = match content_type(headers) {
        Some(ct) if !options.binary && !is_text(&ct) => Cow::Borrowed(BINARY_PLACEHOLDER),
        _ => String::from_utf8_lossy(body),
    };

    if !rendered.is_empty() {
        let _ = write!(record, "\n{}\n", rendered);
    }

    record.push_str(&"_".repeat(DELIMITER_WIDTH));
    record.push_str("\n\n");
}

/// Media type of the first `Content-Type` value, without parameters.
fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .map(|v| v.split(';').next().unwrap_or_default().trim().to_string())
        .filter(|v| !v.is_empty())
}

fn is_text(content_type: &str) -> bool {
    TEXT_CONTENT_TYPES.iter().any(|t| content_type.contains(t))
}

/// `content-type` -> `Content-Type`.
fn canonical_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::{match_request_url, match_response_status, InterceptPipeline, InterceptRegistry};
    use crate::sink::SyncWriter;
    use bytes::Bytes;
    use hyper::header::HeaderValue;
    use hyper::{Method, StatusCode};
    use reqwest::Url;

    fn delimiter() -> String {
        format!("{}\n\n", "_".repeat(106))
    }

    fn request(content_type: Option<&'static str>, body: &'static [u8]) -> ProxyRequest {
        let mut r = ProxyRequest::new(Method::POST, Url::parse("http://a.test/echo/?data=x").unwrap());
        if let Some(ct) = content_type {
            r.headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(ct));
        }
        r.body = Bytes::from_static(body);
        r
    }

    #[test]
    fn request_record_format() {
        let mut r = request(Some("text/plain; charset=utf-8"), b"hello");
        r.headers.append("x-multi", HeaderValue::from_static("a"));
        r.headers.append("x-multi", HeaderValue::from_static("b"));

        let record = render_request(&r, &CaptureOptions::default());

        assert_eq!(
            record,
            format!(
                ">>> POST http://a.test/echo/?data=x\n\n\
                 Content-Type: text/plain; charset=utf-8\n\
                 X-Multi: a,b\n\
                 \nhello\n{}",
                delimiter()
            )
        );
    }

    #[test]
    fn response_record_format() {
        let mut res = ProxyResponse::new(request(None, b""), StatusCode::NOT_FOUND);
        res.headers.insert(header::VIA, HeaderValue::from_static("hflow"));

        let record = render_response(&res, &CaptureOptions::default());

        assert_eq!(
            record,
            format!(
                "<<< 404 Not Found from POST http://a.test/echo/?data=x\n\nVia: hflow\n{}",
                delimiter()
            )
        );
    }

    #[test]
    fn non_text_bodies_are_replaced() {
        let r = request(Some("image/png"), b"\x89PNG");
        let record = render_request(&r, &CaptureOptions::default());
        assert!(record.contains(&format!("\n{}\n", BINARY_PLACEHOLDER)));

        let record = render_request(&r, &CaptureOptions::default().with_binary(true));
        assert!(!record.contains(BINARY_PLACEHOLDER));
    }

    #[test]
    fn text_markers_are_recognized() {
        for ct in [
            "text/html",
            "application/json",
            "application/xml",
            "application/javascript",
            "application/x-www-form-urlencoded",
        ] {
            let r = request(Some(ct), b"readable");
            let record = render_request(&r, &CaptureOptions::default());
            assert!(record.contains("\nreadable\n"), "{ct}");
        }
    }

    #[test]
    fn bodies_without_content_type_are_rendered() {
        let r = request(None, b"untyped");
        let record = render_request(&r, &CaptureOptions::default());
        assert!(record.contains("\nuntyped\n"));

        let r = request(Some(";charset=utf-8"), b"parameters only");
        let record = render_request(&r, &CaptureOptions::default());
        assert!(record.contains("\nparameters only\n"));
    }

    #[test]
    fn limit_truncates_body() {
        let r = request(Some("text/plain"), b"0123456789");

        let record = render_request(&r, &CaptureOptions::default().with_limit(4));
        assert!(record.contains("\n0123\n"));

        let record = render_request(&r, &CaptureOptions::default().with_limit(-1));
        assert!(record.contains("\n0123456789\n"));

        let record = render_request(&r, &CaptureOptions::default().with_limit(0));
        assert!(record.ends_with(&format!("Content-Type: text/plain\n{}", delimiter())));
    }

    #[test]
    fn limit_does_not_produce_invalid_utf8() {
        let r = request(Some("text/plain"), "héllo".as_bytes());
        let record = render_request(&r, &CaptureOptions::default().with_limit(2));
        assert!(record.contains("\nh\u{FFFD}\n"));
    }

    #[test]
    fn writer_submits_without_modifying() {
        let out = SyncWriter::new(Vec::new());
        let (sink, worker) = CaptureSink::spawn(out.clone()).unwrap();

        let registry = InterceptRegistry::new();
        registry.add(writer(
            "capture",
            match_request_url("echo"),
            match_response_status("", match_request_url("echo")),
            CaptureOptions::default(),
            sink,
        ));

        let pipeline = InterceptPipeline::default();
        let snapshot = registry.snapshot();

        let mut req = request(Some("text/plain"), b"hello");
        pipeline.intercept_request(&mut req, &snapshot).unwrap();
        assert_eq!(req.body, "hello");

        let mut res = ProxyResponse::new(req.clone(), StatusCode::OK);
        res.body = Bytes::from_static(b"world");
        pipeline.intercept_response(&mut res, &snapshot).unwrap();
        assert_eq!(res.body, "world");

        drop(snapshot);
        drop(registry);
        worker.join();

        let captured = String::from_utf8(out.lock().clone()).unwrap();
        assert!(captured.starts_with(">>> POST http://a.test/echo/?data=x\n"));
        assert!(captured.contains("\n<<< 200 OK from POST http://a.test/echo/?data=x\n"));
        assert!(captured.contains("\nworld\n"));
        assert_eq!(captured.matches(&delimiter()).count(), 2);
    }

    #[test]
    fn canonical_header_names() {
        assert_eq!(canonical_name("content-type"), "Content-Type");
        assert_eq!(canonical_name("x-test"), "X-Test");
        assert_eq!(canonical_name("via"), "Via");
    }
}
