use std::sync::Arc;

use api_types::ClusterConfig;
use api_types::ClustersResponse;
use api_types::DeploymentDetail;
use api_types::DeploymentListResponse;
use api_types::HealthResponse;
use api_types::MessageResponse;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use poem::web::Query;
use poem::IntoResponse;
use poem::Response;
use serde::Deserialize;
use tracing::error;
use tracing::info;

use super::errors::ApiError;
use crate::informer::DeploymentStore;
use crate::informer::LabelSelector;
use crate::manager::MultiClusterManager;

/// Value of `source` in deployment listings.
pub const CACHE_SOURCE: &str = "informer-cache";

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<MultiClusterManager>,
    /// Cluster served by `/deployments` when no `cluster` is given
    pub default_cluster: Option<String>,
}

impl ApiState {
    pub fn new(manager: Arc<MultiClusterManager>, default_cluster: Option<String>) -> Self {
        Self {
            manager,
            default_cluster,
        }
    }

    fn store(&self, cluster: Option<&str>) -> Result<(String, DeploymentStore), ApiError> {
        let cluster_id = cluster
            .filter(|c| !c.is_empty())
            .or(self.default_cluster.as_deref())
            .ok_or_else(|| ApiError::unavailable("Informer cache not configured"))?;

        self.manager
            .store(cluster_id)
            .map(|store| (cluster_id.to_string(), store))
            .ok_or_else(|| {
                ApiError::unavailable(format!(
                    "Informer cache not configured for cluster {cluster_id}"
                ))
            })
    }
}

#[handler]
pub fn health(state: Data<&ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        time: chrono::Utc::now().to_rfc3339(),
        version: utils::version::VERSION.to_string(),
        cluster_count: state.manager.get_cluster_count(),
    })
}

#[handler]
pub fn list_clusters(state: Data<&ApiState>) -> Json<ClustersResponse> {
    let clusters = state.manager.get_clusters();
    Json(ClustersResponse {
        count: clusters.len(),
        clusters,
    })
}

/// Register a cluster at runtime.
///
/// The body is parsed by hand so malformed JSON still gets the JSON error
/// envelope.
#[handler]
pub fn add_cluster(state: Data<&ApiState>, body: String) -> poem::Result<Response> {
    let config: ClusterConfig = serde_json::from_str(&body).map_err(|e| {
        error!("Invalid cluster configuration JSON: {e}");
        ApiError::bad_request("Invalid cluster configuration format")
    })?;

    if config.cluster_id.is_empty() {
        error!("Missing required cluster_id field");
        return Err(ApiError::bad_request("Missing required cluster_id field").into());
    }

    let cluster_id = config.cluster_id.clone();
    state.manager.add_cluster(config).map_err(|report| {
        error!(cluster_id = %cluster_id, "Failed to add cluster: {report:?}");
        ApiError::server_error(format!(
            "Failed to add cluster: {}",
            report.current_context()
        ))
    })?;

    info!(cluster_id = %cluster_id, "Added new cluster to manager");
    Ok(Json(MessageResponse {
        message: format!("Cluster {cluster_id} added successfully"),
    })
    .with_status(StatusCode::CREATED)
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct RemoveClusterQuery {
    pub id: Option<String>,
}

#[handler]
pub fn remove_cluster(
    state: Data<&ApiState>,
    Query(query): Query<RemoveClusterQuery>,
) -> poem::Result<Json<MessageResponse>> {
    let Some(cluster_id) = query.id.filter(|id| !id.is_empty()) else {
        error!("Missing cluster_id parameter");
        return Err(ApiError::bad_request("Missing cluster_id parameter").into());
    };

    state.manager.remove_cluster(&cluster_id).map_err(|report| {
        ApiError::not_found(report.current_context().to_string())
    })?;

    info!(cluster_id = %cluster_id, "Removed cluster from manager");
    Ok(Json(MessageResponse {
        message: format!("Cluster {cluster_id} removed successfully"),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeploymentsQuery {
    #[serde(default)]
    pub namespace: String,
    pub format: Option<String>,
    pub label_selector: Option<String>,
    pub cluster: Option<String>,
}

/// List deployments from a cluster's cache.
///
/// `format=simple` returns a bare array of names; anything else returns the
/// detailed listing.
#[handler]
pub fn list_deployments(
    state: Data<&ApiState>,
    Query(query): Query<DeploymentsQuery>,
) -> poem::Result<Response> {
    let (cluster_id, store) = state.store(query.cluster.as_deref())?;

    let deployments = match query.label_selector.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => {
            let selector: LabelSelector = raw.parse().map_err(|report| {
                ApiError::bad_request(format!("Invalid label selector: {report}"))
            })?;
            store.list_by_selector(&query.namespace, &selector)
        }
        None => store.list(&query.namespace),
    };

    let names: Vec<String> = deployments.iter().map(|d| d.name.clone()).collect();
    info!(
        cluster_id = %cluster_id,
        namespace = %query.namespace,
        count = names.len(),
        "Deployments retrieved from cache"
    );

    if query.format.as_deref() == Some("simple") {
        return Ok(Json(names).into_response());
    }

    Ok(Json(DeploymentListResponse {
        namespace: query.namespace,
        count: deployments.len(),
        source: CACHE_SOURCE.to_string(),
        names,
        items: deployments.iter().map(|d| d.to_item()).collect(),
    })
    .into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct DeploymentQuery {
    pub cluster: Option<String>,
}

#[handler]
pub fn get_deployment(
    state: Data<&ApiState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(query): Query<DeploymentQuery>,
) -> poem::Result<Json<DeploymentDetail>> {
    let (cluster_id, store) = state.store(query.cluster.as_deref())?;
    let record = store.get(&namespace, &name).ok_or_else(|| {
        ApiError::not_found(format!("Deployment {namespace}/{name} not found"))
    })?;
    Ok(Json(record.to_detail(&cluster_id)))
}
