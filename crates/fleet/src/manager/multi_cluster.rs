use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use api_types::ClusterConfig;
use error_stack::Report;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::handle::ClusterHandle;
use super::ManagerError;
use crate::controller::ControllerFactory;
use crate::controller::ControllerState;
use crate::informer::DeploymentStore;

/// Everything a controller launched by [`MultiClusterManager::start_all`]
/// needs, kept so clusters added later join the same run.
struct RunContext {
    tracker: TaskTracker,
    errors: mpsc::Sender<Report<ManagerError>>,
    token: CancellationToken,
}

/// Owns the cluster registry and runs one controller task per cluster.
pub struct MultiClusterManager {
    factory: Arc<dyn ControllerFactory>,
    clusters: RwLock<HashMap<String, Arc<ClusterHandle>>>,
    running: Mutex<Option<RunContext>>,
}

impl MultiClusterManager {
    pub fn new(factory: Arc<dyn ControllerFactory>) -> Self {
        Self {
            factory,
            clusters: RwLock::new(HashMap::new()),
            running: Mutex::new(None),
        }
    }

    /// Register a cluster.
    ///
    /// The controller is built immediately and started by [`Self::start_all`],
    /// or right away if the manager is already running.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::InvalidConfig`] if the cluster id is empty or the
    ///   controller cannot be built from `config`
    /// - [`ManagerError::DuplicateCluster`] if the id is already registered;
    ///   the registry is left untouched
    pub fn add_cluster(&self, config: ClusterConfig) -> Result<(), Report<ManagerError>> {
        let cluster_id = config.cluster_id.clone();
        if cluster_id.is_empty() {
            return Err(Report::new(ManagerError::InvalidConfig {
                message: "cluster_id must not be empty".to_string(),
            }));
        }
        if self.contains(&cluster_id) {
            return Err(Report::new(ManagerError::DuplicateCluster { cluster_id }));
        }

        let config = Arc::new(config);
        let runner = self.factory.build(config.clone()).map_err(|report| {
            report.change_context(ManagerError::InvalidConfig {
                message: format!("cannot build controller for cluster {cluster_id}"),
            })
        })?;
        let handle = Arc::new(ClusterHandle::new(config, runner));

        {
            let mut clusters = self.clusters.write().expect("poisoned");
            if clusters.contains_key(&cluster_id) {
                return Err(Report::new(ManagerError::DuplicateCluster { cluster_id }));
            }
            clusters.insert(cluster_id.clone(), handle.clone());
        }
        info!(
            cluster_id = %cluster_id,
            name = %handle.config().display_name(),
            "Cluster added"
        );

        let running = self.running.lock().expect("poisoned");
        if let Some(ctx) = running.as_ref().filter(|ctx| !ctx.token.is_cancelled()) {
            Self::launch(handle, ctx);
        }
        Ok(())
    }

    /// Deregister a cluster and cancel its controller if it is running.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::UnknownCluster`] if no cluster has this id
    pub fn remove_cluster(&self, cluster_id: &str) -> Result<(), Report<ManagerError>> {
        let removed = self
            .clusters
            .write()
            .expect("poisoned")
            .remove(cluster_id);

        let Some(handle) = removed else {
            return Err(Report::new(ManagerError::UnknownCluster {
                cluster_id: cluster_id.to_string(),
            }));
        };

        handle.transition(ControllerState::Running, ControllerState::Stopping);
        handle.cancel();
        info!(cluster_id, "Cluster removed");
        Ok(())
    }

    /// Run every registered controller until `token` is cancelled.
    ///
    /// Returns as soon as one controller fails for a reason other than
    /// cancellation; the others keep running until `token` is cancelled.
    /// On cancellation, returns only after every controller task has exited.
    ///
    /// The run outlives this call: clusters added later are launched until
    /// `token` is cancelled, and [`Self::wait_stopped`] joins them.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::Cancelled`] when `token` is cancelled
    /// - [`ManagerError::Controller`] with the first controller failure
    /// - [`ManagerError::AlreadyRunning`] if a run is already in progress
    pub async fn start_all(&self, token: CancellationToken) -> Result<(), Report<ManagerError>> {
        let tracker = TaskTracker::new();
        let mut errors = {
            let mut running = self.running.lock().expect("poisoned");
            if running.as_ref().is_some_and(|ctx| !ctx.token.is_cancelled()) {
                return Err(Report::new(ManagerError::AlreadyRunning));
            }

            let handles: Vec<Arc<ClusterHandle>> = self
                .clusters
                .read()
                .expect("poisoned")
                .values()
                .cloned()
                .collect();
            if handles.is_empty() {
                warn!("No clusters registered yet, waiting for clusters to be added");
            } else {
                info!(clusters = handles.len(), "Starting cluster controllers");
            }

            let (errors_tx, errors_rx) = mpsc::channel(handles.len().max(1));
            let ctx = RunContext {
                tracker: tracker.clone(),
                errors: errors_tx,
                token: token.clone(),
            };
            for handle in handles {
                Self::launch(handle, &ctx);
            }
            *running = Some(ctx);
            errors_rx
        };
        tracker.close();

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(Report::new(ManagerError::Cancelled)),
            Some(report) = errors.recv() => Err(report),
            _ = tracker.wait() => {
                if token.is_cancelled() {
                    Err(Report::new(ManagerError::Cancelled))
                } else {
                    errors.try_recv().map_or(Ok(()), Err)
                }
            }
        };

        match &result {
            Ok(()) => info!("All cluster controllers exited"),
            Err(report) if matches!(report.current_context(), ManagerError::Cancelled) => {
                info!("Shutdown requested, waiting for cluster controllers to stop");
                tracker.wait().await;
            }
            Err(report) => debug!("Cluster controllers stopped: {report}"),
        }
        result
    }

    /// Wait until the current run is cancelled and every controller task
    /// has exited, including clusters launched after [`Self::start_all`]
    /// returned. Returns at once if nothing was started.
    pub async fn wait_stopped(&self) {
        let run = self
            .running
            .lock()
            .expect("poisoned")
            .as_ref()
            .map(|ctx| (ctx.token.clone(), ctx.tracker.clone()));
        let Some((token, tracker)) = run else {
            return;
        };
        token.cancelled().await;
        tracker.wait().await;
        debug!("All cluster controller tasks joined");
    }

    /// Mark running controllers as stopping.
    ///
    /// Controllers are torn down by cancelling the token given to
    /// [`Self::start_all`], which also waits for them to exit.
    pub fn stop_all(&self) {
        let clusters = self.clusters.read().expect("poisoned");
        let mut stopping = 0;
        for handle in clusters.values() {
            if handle.transition(ControllerState::Running, ControllerState::Stopping) {
                stopping += 1;
            }
        }
        info!(
            clusters = clusters.len(),
            stopping, "Stopping all cluster controllers"
        );
    }

    /// Start one controller on the run's tracker. No-op if already launched.
    fn launch(handle: Arc<ClusterHandle>, ctx: &RunContext) {
        let token = ctx.token.child_token();
        if !handle.bind(token.clone()) {
            debug!(cluster_id = handle.cluster_id(), "Cluster already launched");
            return;
        }
        handle.set_state(ControllerState::Starting);

        let errors = ctx.errors.clone();
        ctx.tracker.spawn(async move {
            let cluster_id = handle.cluster_id().to_string();
            info!(cluster_id = %cluster_id, "Starting cluster controller task");
            handle.transition(ControllerState::Starting, ControllerState::Running);

            let result = handle.runner().run(token.clone()).await;
            handle.set_state(ControllerState::Stopped);
            handle.unbind();

            match result {
                Ok(()) => info!(cluster_id = %cluster_id, "Cluster controller exited"),
                Err(report) if token.is_cancelled() => {
                    debug!(cluster_id = %cluster_id, "Cluster controller error after cancellation: {report:?}");
                }
                Err(report) => {
                    error!(cluster_id = %cluster_id, "Cluster controller failed: {report:?}");
                    let report =
                        report.change_context(ManagerError::Controller { cluster_id: cluster_id.clone() });
                    if errors.try_send(report).is_err() {
                        debug!(cluster_id = %cluster_id, "First failure already reported, dropping error");
                    }
                }
            }
        });
    }

    pub fn contains(&self, cluster_id: &str) -> bool {
        self.clusters
            .read()
            .expect("poisoned")
            .contains_key(cluster_id)
    }

    /// Snapshot of registered cluster configs keyed by id.
    pub fn get_clusters(&self) -> BTreeMap<String, ClusterConfig> {
        self.clusters
            .read()
            .expect("poisoned")
            .iter()
            .map(|(id, handle)| (id.clone(), ClusterConfig::clone(handle.config())))
            .collect()
    }

    pub fn get_cluster_count(&self) -> usize {
        self.clusters.read().expect("poisoned").len()
    }

    /// Cache of the given cluster, if registered and cache-backed.
    pub fn store(&self, cluster_id: &str) -> Option<DeploymentStore> {
        let handle = self
            .clusters
            .read()
            .expect("poisoned")
            .get(cluster_id)
            .cloned()?;
        handle.store()
    }

    pub fn cluster_state(&self, cluster_id: &str) -> Option<ControllerState> {
        self.clusters
            .read()
            .expect("poisoned")
            .get(cluster_id)
            .map(|handle| handle.state())
    }
}
