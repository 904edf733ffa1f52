use std::collections::HashSet;
use std::path::Path;

use api_types::ClusterConfig;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use tracing::info;

use super::ConfigError;

/// Either a bare list of clusters or a `clusters:` key holding one.
#[derive(Deserialize)]
#[serde(untagged)]
enum ClustersDocument {
    List(Vec<ClusterConfig>),
    Wrapped { clusters: Vec<ClusterConfig> },
}

/// Parse a YAML clusters document.
///
/// # Errors
///
/// - [`ConfigError::Invalid`] if an entry has no `cluster_id` or an id is
///   repeated
pub fn parse_clusters(yaml: &str, path: &str) -> Result<Vec<ClusterConfig>, Report<ConfigError>> {
    let document: ClustersDocument =
        serde_yaml::from_str(yaml).change_context(ConfigError::ParseFailed {
            path: path.to_string(),
        })?;
    let clusters = match document {
        ClustersDocument::List(clusters) | ClustersDocument::Wrapped { clusters } => clusters,
    };

    let mut seen = HashSet::new();
    for (index, cluster) in clusters.iter().enumerate() {
        if cluster.cluster_id.is_empty() {
            return Err(Report::new(ConfigError::Invalid {
                message: format!("entry {index} in {path} has no cluster_id"),
            }));
        }
        if !seen.insert(cluster.cluster_id.as_str()) {
            return Err(Report::new(ConfigError::Invalid {
                message: format!("cluster {} is listed twice in {path}", cluster.cluster_id),
            }));
        }
    }
    Ok(clusters)
}

/// Load additional cluster configurations from a YAML file.
///
/// # Errors
///
/// - [`ConfigError::ReadFailed`] if the file cannot be read
/// - [`ConfigError::ParseFailed`] if it is not a list of cluster configs
/// - [`ConfigError::Invalid`] if an entry is unusable
pub fn load_clusters_file(path: &Path) -> Result<Vec<ClusterConfig>, Report<ConfigError>> {
    let source = path.display().to_string();
    let yaml = std::fs::read_to_string(path).change_context(ConfigError::ReadFailed {
        path: source.clone(),
    })?;
    let clusters = parse_clusters(&yaml, &source)?;
    info!(path = %source, count = clusters.len(), "Loaded cluster configurations");
    Ok(clusters)
}
