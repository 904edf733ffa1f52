use std::sync::Arc;
use std::time::Duration;

use api_types::ClusterConfig;
use error_stack::Report;
use error_stack::ResultExt;
use kube::Client;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::error;
use tracing::info;

use super::audit::AuditLogger;
use super::client::init_kube_client;
use super::client::ClientOptions;
use super::client::CredentialSource;
use super::leader::LeaderElectionSettings;
use super::leader::LeaderElector;
use super::ClusterRunner;
use super::ControllerError;
use super::ControllerFactory;
use crate::informer::DeploymentInformer;
use crate::informer::DeploymentStore;
use crate::informer::InformerOptions;
use crate::metrics::server::MetricsState;
use crate::metrics::ClusterMetrics;

/// Settings shared by every controller the daemon builds.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Informer defaults; the namespace is taken from each cluster's config
    pub informer: InformerOptions,
    pub client: ClientOptions,
    /// Capacity of the channel between informer and audit loop
    pub event_buffer: usize,
    pub lease_duration: Duration,
    pub lease_renew_interval: Duration,
    /// Lease namespace when the cluster config does not name one
    pub default_lease_namespace: String,
    /// Lease name when the cluster config does not name one
    pub default_lease_id: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            informer: InformerOptions::default(),
            client: ClientOptions::default(),
            event_buffer: 256,
            lease_duration: Duration::from_secs(15),
            lease_renew_interval: Duration::from_secs(5),
            default_lease_namespace: "kube-system".to_string(),
            default_lease_id: "fleet-controller".to_string(),
        }
    }
}

/// Controller for one cluster: deployment informer, audit loop and, when
/// configured, leader election and a metrics endpoint.
pub struct ClusterController {
    config: Arc<ClusterConfig>,
    credentials: CredentialSource,
    settings: Arc<ControllerSettings>,
    informer: Arc<DeploymentInformer>,
    metrics: Arc<ClusterMetrics>,
}

impl ClusterController {
    /// Validate `config` and prepare its controller.
    ///
    /// # Errors
    ///
    /// - [`ControllerError::InvalidConfig`] if the credential source is
    ///   ambiguous
    /// - [`ControllerError::MetricsRegistry`] if the metrics cannot be
    ///   registered
    pub fn new(
        config: Arc<ClusterConfig>,
        settings: Arc<ControllerSettings>,
    ) -> Result<Self, Report<ControllerError>> {
        let credentials = CredentialSource::from_config(&config)?;

        let mut options = settings.informer.clone();
        options.namespace = config.watched_namespace().map(str::to_string);

        let metrics = ClusterMetrics::new(&config.cluster_id).map_err(|e| {
            Report::new(ControllerError::MetricsRegistry {
                cluster_id: config.cluster_id.clone(),
            })
            .attach_printable(e.to_string())
        })?;
        let metrics = Arc::new(metrics);
        let informer = Arc::new(DeploymentInformer::new(
            config.cluster_id.clone(),
            options,
            metrics.clone(),
        ));

        Ok(Self {
            config,
            credentials,
            settings,
            informer,
            metrics,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialSource {
        &self.credentials
    }

    pub fn metrics(&self) -> Arc<ClusterMetrics> {
        self.metrics.clone()
    }

    /// Lease parameters, or `None` when leader election is disabled.
    pub fn leader_settings(&self) -> Option<LeaderElectionSettings> {
        let election = &self.config.leader_election;
        if !election.enabled {
            return None;
        }

        let lease_name = election
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| self.settings.default_lease_id.clone());
        let namespace = election
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| self.settings.default_lease_namespace.clone());

        let mut settings = LeaderElectionSettings::new(lease_name, namespace);
        settings.lease_duration = self.settings.lease_duration;
        settings.renew_interval = self.settings.lease_renew_interval;
        Some(settings)
    }

    /// Start leader election if enabled and return the leadership signal.
    fn start_leader_election(
        &self,
        tracker: &TaskTracker,
        client: Client,
        token: &CancellationToken,
    ) -> watch::Receiver<bool> {
        match self.leader_settings() {
            Some(settings) => {
                let elector = LeaderElector::new(
                    self.config.cluster_id.clone(),
                    client,
                    settings,
                    self.metrics.clone(),
                );
                let leader = elector.subscribe();
                tracker.spawn(elector.run(token.clone()));
                leader
            }
            None => {
                self.metrics.set_leader(true);
                let (_, leader) = watch::channel(true);
                leader
            }
        }
    }

    fn start_metrics_endpoint(&self, tracker: &TaskTracker, token: &CancellationToken) {
        let Some(address) = self
            .config
            .metrics_bind_address
            .clone()
            .filter(|addr| !addr.is_empty())
        else {
            return;
        };

        let state = MetricsState {
            cluster_id: self.config.cluster_id.clone(),
            metrics: self.metrics.clone(),
            store: self.informer.store(),
        };
        let token = token.clone();
        tracker.spawn(async move {
            if let Err(report) = crate::metrics::server::serve(address, state, token).await {
                error!("Metrics endpoint stopped: {report:?}");
            }
        });
    }
}

#[async_trait::async_trait]
impl ClusterRunner for ClusterController {
    fn cluster_id(&self) -> &str {
        &self.config.cluster_id
    }

    fn store(&self) -> Option<DeploymentStore> {
        Some(self.informer.store())
    }

    #[tracing::instrument(skip_all, fields(cluster_id = %self.config.cluster_id))]
    async fn run(&self, token: CancellationToken) -> Result<(), Report<ControllerError>> {
        info!(
            name = %self.config.display_name(),
            namespace = self.config.watched_namespace().unwrap_or("<all>"),
            "Starting cluster controller"
        );
        self.informer.reset();

        let client = init_kube_client(&self.credentials, &self.settings.client)
            .await
            .attach_printable_lazy(|| format!("cluster {}", self.config.cluster_id))?;

        let tasks_token = token.child_token();
        let tracker = TaskTracker::new();
        let (events_tx, events_rx) = mpsc::channel(self.settings.event_buffer.max(1));

        let informer = self.informer.clone();
        let informer_client = client.clone();
        let informer_token = tasks_token.clone();
        tracker.spawn(async move {
            informer
                .run(informer_client, events_tx, informer_token)
                .await;
        });

        let leader = self.start_leader_election(&tracker, client, &tasks_token);
        let audit = AuditLogger::new(self.config.cluster_id.clone(), leader, self.metrics.clone());
        tracker.spawn(audit.run(events_rx, tasks_token.clone()));

        self.start_metrics_endpoint(&tracker, &tasks_token);
        tracker.close();

        let synced = tokio::select! {
            _ = token.cancelled() => None,
            result = self.informer.wait_for_sync() => Some(result),
        };

        match synced {
            Some(Err(report)) => {
                error!("Deployment cache failed to sync: {report:?}");
                tasks_token.cancel();
                tracker.wait().await;
                return Err(report.change_context(ControllerError::CacheSync {
                    cluster_id: self.config.cluster_id.clone(),
                }));
            }
            Some(Ok(())) => {
                info!(deployments = self.informer.store().len(), "Cluster controller running");
                token.cancelled().await;
            }
            None => {}
        }

        info!("Stopping cluster controller");
        tasks_token.cancel();
        tracker.wait().await;
        info!("Cluster controller stopped");
        Ok(())
    }
}

/// Builds [`ClusterController`]s backed by real Kubernetes clients.
#[derive(Debug, Clone, Default)]
pub struct KubeControllerFactory {
    settings: Arc<ControllerSettings>,
}

impl KubeControllerFactory {
    pub fn new(settings: ControllerSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

impl ControllerFactory for KubeControllerFactory {
    fn build(
        &self,
        config: Arc<ClusterConfig>,
    ) -> Result<Arc<dyn ClusterRunner>, Report<ControllerError>> {
        let controller = ClusterController::new(config, self.settings.clone())?;
        Ok(Arc::new(controller))
    }
}
