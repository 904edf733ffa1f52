//! Shared API type definitions
//!
//! This crate contains the wire types exchanged over the fleet HTTP API:
//! cluster registration descriptors, deployment cache views and the
//! common success/error envelopes.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Leader election descriptor for a single cluster controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderElectionConfig {
    /// Whether reconciliation is gated on holding a Lease
    #[serde(default)]
    pub enabled: bool,
    /// Namespace holding the Lease object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Lease name shared by competing controller instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Identity and connection descriptor for one cluster.
///
/// `kubeconfig` and `in_cluster` are mutually exclusive. When neither is set
/// the default credential inference chain is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Unique cluster identifier, primary key of the registry
    #[serde(default)]
    pub cluster_id: String,
    /// Human readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Path to a kubeconfig file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    /// Context inside the kubeconfig file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Use the in-cluster service account
    #[serde(default)]
    pub in_cluster: bool,
    /// Namespace to watch, empty or absent for all namespaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub leader_election: LeaderElectionConfig,
    /// Address for the per-cluster metrics endpoint, absent to disable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_bind_address: Option<String>,
}

impl ClusterConfig {
    /// Namespace filter with the empty string normalized to "all namespaces".
    pub fn watched_namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }

    /// Display name, falling back to the cluster id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.cluster_id)
    }
}

/// Response for `GET /clusters`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClustersResponse {
    pub count: usize,
    pub clusters: BTreeMap<String, ClusterConfig>,
}

/// Per-deployment line in the detailed `/deployments` listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentItem {
    pub name: String,
    pub namespace: String,
    /// Desired replica count from the spec
    pub desired: i32,
    /// Observed replica count from the status
    pub replicas: i32,
    pub ready: i32,
    pub available: i32,
}

/// Detailed response for `GET /deployments`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentListResponse {
    pub namespace: String,
    pub count: usize,
    /// Always `informer-cache`: reads never reach the API server
    pub source: String,
    pub names: Vec<String>,
    pub items: Vec<DeploymentItem>,
}

/// Full cached snapshot of one deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentDetail {
    pub cluster_id: String,
    pub name: String,
    pub namespace: String,
    pub desired_replicas: i32,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub available_replicas: i32,
    pub image: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub resource_version: Option<String>,
    /// RFC3339 creation timestamp
    pub created: Option<String>,
}

/// Response for `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub time: String,
    pub version: String,
    pub cluster_count: usize,
}

/// Body of every non-2xx response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Body of mutation acknowledgements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_config_defaults_missing_fields() {
        let config: ClusterConfig =
            serde_json::from_str(r#"{"cluster_id": "edge-1", "in_cluster": true}"#)
                .expect("should deserialize minimal cluster config");

        assert_eq!(config.cluster_id, "edge-1");
        assert!(config.in_cluster);
        assert!(config.kubeconfig.is_none());
        assert!(!config.leader_election.enabled);
        assert_eq!(config.display_name(), "edge-1");
    }

    #[test]
    fn missing_cluster_id_deserializes_to_empty() {
        let config: ClusterConfig = serde_json::from_str(r#"{"name": "no-id"}"#)
            .expect("should deserialize config without cluster_id");

        assert!(config.cluster_id.is_empty());
        assert_eq!(config.display_name(), "no-id");
    }

    #[test]
    fn empty_namespace_means_all_namespaces() {
        let mut config = ClusterConfig {
            cluster_id: "a".to_string(),
            namespace: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(config.watched_namespace(), None);

        config.namespace = Some("team-a".to_string());
        assert_eq!(config.watched_namespace(), Some("team-a"));
    }

    #[test]
    fn cluster_config_skips_absent_optionals_when_serialized() {
        let config = ClusterConfig {
            cluster_id: "a".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&config).expect("should serialize");

        assert!(value.get("kubeconfig").is_none());
        assert!(value.get("metrics_bind_address").is_none());
        assert_eq!(value["in_cluster"], serde_json::json!(false));
    }
}
