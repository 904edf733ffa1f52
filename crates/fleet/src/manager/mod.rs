//! Registry and concurrent lifecycle of cluster controllers.

use core::error::Error;

pub mod handle;
pub mod multi_cluster;

pub use handle::ClusterHandle;
pub use multi_cluster::MultiClusterManager;

#[derive(Debug, derive_more::Display)]
pub enum ManagerError {
    #[display("Cluster {cluster_id} is already registered")]
    DuplicateCluster { cluster_id: String },
    #[display("Cluster {cluster_id} not found")]
    UnknownCluster { cluster_id: String },
    #[display("Invalid cluster configuration: {message}")]
    InvalidConfig { message: String },
    #[display("Cluster controller {cluster_id} failed")]
    Controller { cluster_id: String },
    #[display("Cluster controllers are already running")]
    AlreadyRunning,
    #[display("Cancelled")]
    Cancelled,
}

impl Error for ManagerError {}
