use std::sync::Arc;

use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::Application;
use crate::config::load_clusters_file;
use crate::config::DaemonArgs;
use crate::controller::ControllerFactory;
use crate::controller::KubeControllerFactory;
use crate::limiter::PerClientRateLimiter;
use crate::manager::MultiClusterManager;

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
    factory: Option<Arc<dyn ControllerFactory>>,
}

impl ApplicationBuilder {
    /// Create new application builder
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self {
            daemon_args,
            factory: None,
        }
    }

    /// Use a custom controller factory instead of real Kubernetes clients
    pub fn with_factory(mut self, factory: Arc<dyn ControllerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Build complete application
    pub fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let manager = Arc::new(self.create_manager()?);
        let rate_limiter = self.daemon_args.rate_limiter_config().map(|config| {
            tracing::info!(
                requests_per_second = config.rate.get(),
                max_clients = config.max_clients,
                "Per-IP rate limiter initialized"
            );
            Arc::new(PerClientRateLimiter::new(config))
        });
        if rate_limiter.is_none() {
            tracing::info!("Rate limiting disabled");
        }

        let services = ApplicationServices {
            manager,
            rate_limiter,
        };
        Ok(Application::new(services, self.daemon_args))
    }

    /// Create the cluster manager and register the static clusters
    fn create_manager(&self) -> Result<MultiClusterManager> {
        let factory = self.factory.clone().unwrap_or_else(|| {
            Arc::new(KubeControllerFactory::new(
                self.daemon_args.controller_settings(),
            ))
        });
        let manager = MultiClusterManager::new(factory);

        if let Some(primary) = self.daemon_args.primary_cluster() {
            tracing::info!(cluster_id = %primary.cluster_id, "Adding primary cluster to multi-cluster manager");
            manager
                .add_cluster(primary)
                .map_err(|e| anyhow::anyhow!("Failed to add primary cluster: {e:?}"))?;
        }

        if let Some(path) = &self.daemon_args.clusters_file {
            let clusters = load_clusters_file(path)
                .map_err(|e| anyhow::anyhow!("Failed to load clusters file: {e:?}"))?;
            for cluster in clusters {
                let cluster_id = cluster.cluster_id.clone();
                manager
                    .add_cluster(cluster)
                    .map_err(|e| anyhow::anyhow!("Failed to add cluster {cluster_id}: {e:?}"))?;
            }
        }

        if manager.get_cluster_count() == 0 {
            tracing::warn!("No clusters configured; add clusters through the API");
        }
        Ok(manager)
    }
}
