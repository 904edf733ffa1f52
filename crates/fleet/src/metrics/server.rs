use std::sync::Arc;

use error_stack::Report;
use poem::get;
use poem::handler;
use poem::http::header;
use poem::http::StatusCode;
use poem::listener::TcpListener;
use poem::web::Data;
use poem::EndpointExt;
use poem::Response;
use poem::Route;
use poem::Server;
use prometheus::Encoder;
use prometheus::TextEncoder;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::ClusterMetrics;
use crate::controller::ControllerError;
use crate::informer::DeploymentStore;

/// State shared with the `/metrics` handler.
#[derive(Clone)]
pub(crate) struct MetricsState {
    pub cluster_id: String,
    pub metrics: Arc<ClusterMetrics>,
    pub store: DeploymentStore,
}

#[handler]
pub(crate) fn render_metrics(state: Data<&MetricsState>) -> Response {
    match state
        .metrics
        .encode(state.store.len(), state.store.has_synced())
    {
        Ok(body) => Response::builder()
            .header(header::CONTENT_TYPE, TextEncoder::new().format_type())
            .body(body),
        Err(e) => {
            error!(cluster_id = %state.cluster_id, "Failed to encode metrics: {e}");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body("Failed to encode metrics")
        }
    }
}

pub(crate) fn routes(state: MetricsState) -> impl poem::Endpoint {
    Route::new().at("/metrics", get(render_metrics)).data(state)
}

/// Serve `/metrics` on `bind_address` until `token` is cancelled.
///
/// # Errors
///
/// - [`ControllerError::MetricsServer`] if the listener cannot be bound or the
///   server fails
pub(crate) async fn serve(
    bind_address: String,
    state: MetricsState,
    token: CancellationToken,
) -> Result<(), Report<ControllerError>> {
    info!(
        cluster_id = %state.cluster_id,
        address = %bind_address,
        "Starting metrics endpoint"
    );
    let server = Server::new(TcpListener::bind(bind_address.clone()));

    tokio::select! {
        result = server.run(routes(state)) => {
            result.map_err(|e| {
                error!(address = %bind_address, "Metrics endpoint failed: {e}");
                Report::new(ControllerError::MetricsServer {
                    address: bind_address.clone(),
                })
                .attach_printable(e.to_string())
            })
        }
        _ = token.cancelled() => {
            info!(address = %bind_address, "Metrics endpoint stopped");
            Ok(())
        }
    }
}
