use std::sync::Arc;
use std::time::Instant;

use poem::http::HeaderValue;
use poem::http::StatusCode;
use poem::Endpoint;
use poem::IntoResponse;
use poem::Middleware;
use poem::Request;
use poem::Response;
use poem::Result as PoemResult;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;
use tracing::Instrument;

use crate::limiter::PerClientRateLimiter;

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Assigns every request a UUID, echoes it in `X-Request-ID` and logs the
/// request inside a span carrying that id.
pub struct RequestContext;

impl<E> Middleware<E> for RequestContext
where E: Endpoint
{
    type Output = RequestContextEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        RequestContextEndpoint { inner: ep }
    }
}

pub struct RequestContextEndpoint<E> {
    inner: E,
}

impl<E> Endpoint for RequestContextEndpoint<E>
where E: Endpoint
{
    type Output = Response;

    async fn call(&self, req: Request) -> PoemResult<Self::Output> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let span = tracing::info_span!("request", request_id = %request_id, method = %method, path = %path);

        async move {
            let start = Instant::now();
            debug!(client = %req.remote_addr(), "Request received");

            let mut resp = match self.inner.call(req).await {
                Ok(resp) => resp.into_response(),
                Err(err) => err.into_response(),
            };
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                resp.headers_mut().insert(REQUEST_ID_HEADER, value);
            }

            info!(
                status = resp.status().as_u16(),
                latency_ms = start.elapsed().as_millis() as u64,
                "Request completed"
            );
            Ok(resp)
        }
        .instrument(span)
        .await
    }
}

/// Per-client admission control keyed by the peer IP address.
///
/// Passes every request through when no limiter is configured.
pub struct RateLimit {
    limiter: Option<Arc<PerClientRateLimiter>>,
}

impl RateLimit {
    pub fn new(limiter: Option<Arc<PerClientRateLimiter>>) -> Self {
        Self { limiter }
    }
}

impl<E> Middleware<E> for RateLimit
where E: Endpoint
{
    type Output = RateLimitEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        RateLimitEndpoint {
            inner: ep,
            limiter: self.limiter.clone(),
        }
    }
}

pub struct RateLimitEndpoint<E> {
    inner: E,
    limiter: Option<Arc<PerClientRateLimiter>>,
}

/// Identity used for rate limiting: the peer IP, or the raw remote address
/// for non-socket transports.
pub fn client_identity(req: &Request) -> String {
    let remote = req.remote_addr();
    match remote.as_socket_addr() {
        Some(addr) => addr.ip().to_string(),
        None => remote.to_string(),
    }
}

impl<E> Endpoint for RateLimitEndpoint<E>
where E: Endpoint
{
    type Output = Response;

    async fn call(&self, req: Request) -> PoemResult<Self::Output> {
        if let Some(limiter) = &self.limiter {
            let client_ip = client_identity(&req);
            if !limiter.allow(&client_ip) {
                warn!(client_ip = %client_ip, limit = limiter.rate(), "Rate limit exceeded");
                let body = json!({ "error": "Rate limit exceeded", "retry_after": "1s" });
                return Ok(poem::web::Json(body)
                    .with_status(StatusCode::TOO_MANY_REQUESTS)
                    .into_response());
            }
        }

        self.inner.call(req).await.map(IntoResponse::into_response)
    }
}

/// Adds `X-Content-Type-Options` and `X-Frame-Options` to every response.
pub struct SecurityHeaders;

impl<E> Middleware<E> for SecurityHeaders
where E: Endpoint
{
    type Output = SecurityHeadersEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        SecurityHeadersEndpoint { inner: ep }
    }
}

pub struct SecurityHeadersEndpoint<E> {
    inner: E,
}

impl<E> Endpoint for SecurityHeadersEndpoint<E>
where E: Endpoint
{
    type Output = Response;

    async fn call(&self, req: Request) -> PoemResult<Self::Output> {
        let mut resp = match self.inner.call(req).await {
            Ok(resp) => resp.into_response(),
            Err(err) => err.into_response(),
        };
        let headers = resp.headers_mut();
        headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
        headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
        Ok(resp)
    }
}
