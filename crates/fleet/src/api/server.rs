use std::sync::Arc;

use error_stack::Report;
use poem::error::NotFoundError;
use poem::get;
use poem::http::StatusCode;
use poem::listener::TcpListener;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::errors::error_response;
use super::errors::ApiError;
use super::handlers::add_cluster;
use super::handlers::get_deployment;
use super::handlers::health;
use super::handlers::list_clusters;
use super::handlers::list_deployments;
use super::handlers::remove_cluster;
use super::handlers::ApiState;
use super::middleware::RateLimit;
use super::middleware::RequestContext;
use super::middleware::SecurityHeaders;
use crate::limiter::PerClientRateLimiter;

/// Build the full API endpoint: routes plus the middleware stack.
///
/// The request id and security headers wrap the rate limiter so rejected
/// responses carry them too.
pub fn build_app(state: ApiState, limiter: Option<Arc<PerClientRateLimiter>>) -> impl Endpoint {
    Route::new()
        .at("/health", get(health))
        .at(
            "/clusters",
            get(list_clusters).post(add_cluster).delete(remove_cluster),
        )
        .at("/deployments", get(list_deployments))
        .at("/deployments/:namespace/:name", get(get_deployment))
        .catch_error(|_: NotFoundError| async move {
            error_response(StatusCode::NOT_FOUND, "Not found")
        })
        .data(state)
        .with(RateLimit::new(limiter))
        .with(SecurityHeaders)
        .with(RequestContext)
}

/// HTTP API server exposing the cluster registry and deployment caches
pub struct ApiServer {
    state: ApiState,
    limiter: Option<Arc<PerClientRateLimiter>>,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(
        state: ApiState,
        limiter: Option<Arc<PerClientRateLimiter>>,
        listen_addr: String,
    ) -> Self {
        Self {
            state,
            limiter,
            listen_addr,
        }
    }

    /// Serve until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = build_app(self.state, self.limiter);
        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = token.cancelled() => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}
