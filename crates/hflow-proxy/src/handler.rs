//! Per-exchange orchestration.
//!
//! Every proxied exchange moves through the same stages:
//!
//! ```text
//! Received → RequestIntercepted → Forwarded → ResponseReceived → ResponseIntercepted → Written
//! ```
//!
//! A failure at any stage ends the exchange with `503 Service Unavailable`
//! and an error log naming the stage and the cause. Nothing is written to the
//! client before the whole response is known.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Body;
use hyper::{Request, Response, StatusCode};

use crate::error::Result;
use crate::intercept::{InterceptPipeline, InterceptRegistry};
use crate::message::ProxyResponse;

/// Stage an exchange has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The inbound request arrived.
    Received,
    /// The request phase of the pipeline completed.
    RequestIntercepted,
    /// The request was sent to the origin.
    Forwarded,
    /// The origin's response was buffered.
    ResponseReceived,
    /// The response phase of the pipeline completed.
    ResponseIntercepted,
    /// The response was handed back to the client connection.
    Written,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::RequestIntercepted => "request intercepted",
            Stage::Forwarded => "forwarded",
            Stage::ResponseReceived => "response received",
            Stage::ResponseIntercepted => "response intercepted",
            Stage::Written => "written",
        };
        f.write_str(name)
    }
}

/// Builds the outbound client.
///
/// Redirects are never followed and environment proxies are ignored, so the
/// client sees exactly what the origin sent. Bodies are not decompressed by
/// the client; the pipeline's codecs own that.
pub fn build_client(accept_invalid_certs: bool, connect_timeout: Duration) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .tls_info(true)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .connect_timeout(connect_timeout)
        .build()?;

    Ok(client)
}

/// Runs exchanges through the intercept pipeline and the origin.
#[derive(Debug, Clone)]
pub struct ProxyHandler {
    client: reqwest::Client,
    registry: Arc<InterceptRegistry>,
    pipeline: InterceptPipeline,
}

impl ProxyHandler {
    /// Creates a handler.
    pub fn new(
        client: reqwest::Client,
        registry: Arc<InterceptRegistry>,
        pipeline: InterceptPipeline,
    ) -> Self {
        Self {
            client,
            registry,
            pipeline,
        }
    }

    /// The registry consulted for every exchange.
    pub fn registry(&self) -> &Arc<InterceptRegistry> {
        &self.registry
    }

    /// Proxies one exchange. `req` must carry an absolute URI.
    ///
    /// Never fails: errors become an empty `503` response.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: fmt::Display,
    {
        let target = req.uri().to_string();
        let mut stage = Stage::Received;

        match self.exchange(req, &mut stage).await {
            Ok(res) => res,
            Err(e) => {
                tracing::error!("error proxying [{}] after stage [{}]: {}", target, stage, e);
                service_unavailable()
            }
        }
    }

    async fn exchange<B>(&self, req: Request<B>, stage: &mut Stage) -> Result<Response<Full<Bytes>>>
    where
        B: Body,
        B::Error: fmt::Display,
    {
        tracing::debug!("<<< received proxy request for [{}]", req.uri());

        let request = self
            .pipeline
            .apply_to_request(req, &self.registry.snapshot())
            .await?;
        *stage = Stage::RequestIntercepted;

        tracing::trace!(">>> requesting [{} {}]", request.method, request.url);
        let upstream = request.to_outbound(&self.client).send().await?;
        *stage = Stage::Forwarded;

        tracing::trace!("<<< received [{}] in response to [{}]", upstream.status(), request.url);
        let upstream = Response::<reqwest::Body>::from(upstream);

        let mut response =
            ProxyResponse::from_response(request, upstream, self.pipeline.codecs()).await?;
        *stage = Stage::ResponseReceived;

        self.pipeline
            .intercept_response(&mut response, &self.registry.snapshot())?;
        *stage = Stage::ResponseIntercepted;

        let url = response.request.url.clone();
        let res = response.into_response(self.pipeline.codecs())?;
        *stage = Stage::Written;

        tracing::trace!(">>> wrote proxy response for [{}]", url);
        Ok(res)
    }
}

/// Empty `503 Service Unavailable`.
pub(crate) fn service_unavailable() -> Response<Full<Bytes>> {
    status_response(StatusCode::SERVICE_UNAVAILABLE)
}

/// Empty response with `status`.
pub(crate) fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut res = Response::new(Full::new(Bytes::new()));
    *res.status_mut() = status;
    res
}
