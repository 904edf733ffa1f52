//! Per-cluster controller.
//!
//! A controller binds one [`ClusterConfig`] to a live Kubernetes client, a
//! [`DeploymentInformer`](crate::informer::DeploymentInformer), the audit
//! reconcile loop and, when configured, Lease based leader election and a
//! metrics endpoint.

use core::error::Error;
use std::sync::Arc;

use api_types::ClusterConfig;
use error_stack::Report;
use tokio_util::sync::CancellationToken;

use crate::informer::DeploymentStore;

pub mod audit;
pub mod client;
pub mod cluster;
pub mod leader;

pub use cluster::ClusterController;
pub use cluster::ControllerSettings;
pub use cluster::KubeControllerFactory;

/// Errors raised by a cluster controller.
#[derive(Debug, derive_more::Display)]
pub enum ControllerError {
    #[display("Invalid cluster configuration: {message}")]
    InvalidConfig { message: String },
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Deployment cache for cluster {cluster_id} failed to sync")]
    CacheSync { cluster_id: String },
    #[display("Metrics endpoint on {address} failed")]
    MetricsServer { address: String },
    #[display("Failed to register metrics for cluster {cluster_id}")]
    MetricsRegistry { cluster_id: String },
}

impl Error for ControllerError {}

/// Lifecycle of a registered cluster controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ControllerState {
    #[display("starting")]
    Starting,
    #[display("running")]
    Running,
    #[display("stopping")]
    Stopping,
    #[display("stopped")]
    Stopped,
}

/// A runnable controller bound to one cluster.
#[async_trait::async_trait]
pub trait ClusterRunner: Send + Sync {
    fn cluster_id(&self) -> &str;

    /// Cache read handle, if this controller maintains one.
    fn store(&self) -> Option<DeploymentStore>;

    /// Run until `token` is cancelled or a fatal error occurs.
    async fn run(&self, token: CancellationToken) -> Result<(), Report<ControllerError>>;
}

/// Builds controllers for newly registered clusters.
pub trait ControllerFactory: Send + Sync {
    /// Validate `config` and construct its controller without starting it.
    fn build(
        &self,
        config: Arc<ClusterConfig>,
    ) -> Result<Arc<dyn ClusterRunner>, Report<ControllerError>>;
}
