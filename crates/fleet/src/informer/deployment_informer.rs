use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use futures::Stream;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::Api;
use kube::Client;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::store::DeploymentStore;
use super::types::DeletedObject;
use super::types::DeploymentEvent;
use super::types::DeploymentRecord;
use super::types::InformerError;
use crate::metrics::ClusterMetrics;

/// Tuning for a [`DeploymentInformer`].
#[derive(Debug, Clone)]
pub struct InformerOptions {
    /// Namespace to watch, `None` for all namespaces
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Interval after which the watch is recreated to force a full relist,
    /// `None` to disable
    pub resync_period: Option<Duration>,
    /// Upper bound for the initial listing
    pub sync_timeout: Duration,
    /// Emit an info line for every applied notification
    pub enable_event_logging: bool,
}

impl Default for InformerOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            label_selector: None,
            field_selector: None,
            resync_period: Some(Duration::from_secs(600)),
            sync_timeout: Duration::from_secs(30),
            enable_event_logging: false,
        }
    }
}

/// Lifecycle of the informer's cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum InformerPhase {
    /// Created, watch not yet opened
    Initializing,
    /// Watch opened, waiting for the initial listing
    Syncing,
    /// Initial listing (or a relist) applied
    Synced,
    /// Applying incremental notifications
    Watching,
}

impl InformerPhase {
    pub fn is_synced(self) -> bool {
        matches!(self, Self::Synced | Self::Watching)
    }
}

/// Why a single watch stream stopped being consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamEnd {
    Cancelled,
    Resync,
    Exhausted,
}

/// Keeps a [`DeploymentStore`] in sync with one cluster.
///
/// Every notification is applied to the store in delivery order and the
/// resulting [`DeploymentEvent`]s are forwarded to the consumer channel.
pub struct DeploymentInformer {
    cluster_id: String,
    options: InformerOptions,
    store: DeploymentStore,
    metrics: Arc<ClusterMetrics>,
    phase: watch::Sender<InformerPhase>,
}

impl DeploymentInformer {
    pub fn new(cluster_id: String, options: InformerOptions, metrics: Arc<ClusterMetrics>) -> Self {
        let (phase, _) = watch::channel(InformerPhase::Initializing);
        Self {
            cluster_id,
            options,
            store: DeploymentStore::new(),
            metrics,
            phase,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Read handle sharing the informer's index.
    pub fn store(&self) -> DeploymentStore {
        self.store.clone()
    }

    pub fn phase(&self) -> InformerPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<InformerPhase> {
        self.phase.subscribe()
    }

    /// Forget the previous run: empty the store and go back to
    /// [`InformerPhase::Initializing`] so the next run must sync again.
    pub(crate) fn reset(&self) {
        self.store.clear();
        self.phase.send_replace(InformerPhase::Initializing);
    }

    /// Wait until the initial listing has been applied.
    ///
    /// # Errors
    ///
    /// - [`InformerError::SyncTimeout`] if the cache does not sync within
    ///   the configured timeout
    pub async fn wait_for_sync(&self) -> Result<(), Report<InformerError>> {
        let timeout = self.options.sync_timeout;
        let mut rx = self.phase.subscribe();

        let waited = tokio::time::timeout(timeout, rx.wait_for(|p| p.is_synced()))
            .await
            .map(|r| r.map(|_| ()));
        match waited {
            Ok(Ok(())) => {
                info!(
                    cluster_id = %self.cluster_id,
                    deployments = self.store.len(),
                    "Deployment informer cache synced, watching for events"
                );
                Ok(())
            }
            Ok(Err(_)) => Err(Report::new(InformerError::Stopped)),
            Err(_) => Err(Report::new(InformerError::SyncTimeout {
                timeout_secs: timeout.as_secs(),
            })
            .attach_printable(format!("cluster {}", self.cluster_id))),
        }
    }

    pub(crate) fn watcher_config(&self) -> watcher::Config {
        let mut config = watcher::Config::default();
        if let Some(labels) = self.options.label_selector.as_deref().filter(|s| !s.is_empty()) {
            config = config.labels(labels);
        }
        if let Some(fields) = self.options.field_selector.as_deref().filter(|s| !s.is_empty()) {
            config = config.fields(fields);
        }
        config
    }

    /// Watch deployments until `token` is cancelled.
    ///
    /// Transient stream errors are retried with backoff by the watcher
    /// itself; the watch is recreated every resync period so the store is
    /// healed by a full relist.
    #[tracing::instrument(skip_all, fields(cluster_id = %self.cluster_id, namespace = ?self.options.namespace))]
    pub async fn run(
        &self,
        client: Client,
        events: mpsc::Sender<DeploymentEvent>,
        token: CancellationToken,
    ) {
        let api: Api<Deployment> = match self.options.namespace.as_deref() {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };

        info!("Starting deployment informer");
        loop {
            if !self.store.has_synced() {
                self.phase.send_replace(InformerPhase::Syncing);
            }

            let stream = watcher(api.clone(), self.watcher_config()).default_backoff();
            match self.process_stream(stream, &events, &token).await {
                StreamEnd::Cancelled => {
                    info!("Deployment informer stopped");
                    break;
                }
                StreamEnd::Resync => {
                    debug!("Resync period elapsed, relisting deployments");
                }
                StreamEnd::Exhausted => {
                    warn!("Deployment watch stream ended unexpectedly, restarting...");
                }
            }
        }
    }

    /// Consume one watch stream, applying every notification in order.
    pub(crate) async fn process_stream<S>(
        &self,
        stream: S,
        events: &mpsc::Sender<DeploymentEvent>,
        token: &CancellationToken,
    ) -> StreamEnd
    where
        S: Stream<Item = Result<watcher::Event<Deployment>, watcher::Error>>,
    {
        let mut stream = pin!(stream);
        let period = self.options.resync_period;
        let mut resync = pin!(async move {
            match period {
                Some(period) => tokio::time::sleep(period).await,
                None => std::future::pending::<()>().await,
            }
        });

        loop {
            let item = tokio::select! {
                _ = token.cancelled() => return StreamEnd::Cancelled,
                _ = &mut resync => return StreamEnd::Resync,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(event)) => {
                    for change in self.apply(event) {
                        if events.send(change).await.is_err() {
                            debug!("Event consumer closed, continuing to maintain cache");
                        }
                    }
                }
                Some(Err(e)) => {
                    self.metrics.watch_errors.inc();
                    warn!("Deployment watch error, retrying: {e}");
                }
                None => return StreamEnd::Exhausted,
            }
        }
    }

    /// Apply one watch notification to the store.
    ///
    /// Returns the resulting cache changes; an update whose resource version
    /// is already cached yields nothing.
    pub(crate) fn apply(&self, event: watcher::Event<Deployment>) -> Vec<DeploymentEvent> {
        let changes: Vec<DeploymentEvent> = match event {
            watcher::Event::Applied(deployment) => {
                self.mark_watching();
                self.decode(&deployment)
                    .and_then(|record| self.store.upsert(record))
                    .into_iter()
                    .collect()
            }
            watcher::Event::Deleted(deployment) => {
                self.mark_watching();
                self.decode(&deployment)
                    .and_then(|record| self.store.delete(record))
                    .into_iter()
                    .collect()
            }
            watcher::Event::Restarted(deployments) => {
                let records = deployments.iter().filter_map(|d| self.decode(d)).collect();
                let changes = self.store.replace(records);
                self.metrics.relists.inc();

                let previous = self.phase.send_replace(InformerPhase::Synced);
                if previous.is_synced() {
                    debug!(
                        cluster_id = %self.cluster_id,
                        deployments = self.store.len(),
                        changes = changes.len(),
                        "Deployment cache relisted"
                    );
                } else {
                    info!(
                        cluster_id = %self.cluster_id,
                        deployments = self.store.len(),
                        "Initial deployment listing applied"
                    );
                }
                changes
            }
        };

        for change in &changes {
            self.observe(change);
        }
        changes
    }

    fn mark_watching(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == InformerPhase::Synced {
                *phase = InformerPhase::Watching;
                true
            } else {
                false
            }
        });
    }

    fn decode(&self, deployment: &Deployment) -> Option<DeploymentRecord> {
        match DeploymentRecord::try_from(deployment) {
            Ok(record) => Some(record),
            Err(report) => {
                self.metrics.dropped_objects.inc();
                warn!(cluster_id = %self.cluster_id, "Dropping deployment notification: {report:?}");
                None
            }
        }
    }

    /// Count a cache change and emit its log lines.
    fn observe(&self, change: &DeploymentEvent) {
        let log_events = self.options.enable_event_logging;
        let cluster_id = self.cluster_id.as_str();

        match change {
            DeploymentEvent::Added(record) => {
                self.metrics.added.inc();
                debug!(
                    cluster_id,
                    name = %record.name,
                    namespace = %record.namespace,
                    replicas = record.desired_replicas,
                    "Processing add event"
                );
                if record.is_monitored() {
                    info!(cluster_id, name = %record.name, "Found monitored deployment");
                }
                if log_events {
                    info!(cluster_id, name = %record.name, namespace = %record.namespace, "Deployment added");
                }
            }
            DeploymentEvent::Updated { old, new } => {
                self.metrics.updated.inc();
                debug!(
                    cluster_id,
                    name = %new.name,
                    namespace = %new.namespace,
                    old_version = ?old.resource_version,
                    new_version = ?new.resource_version,
                    "Processing update event"
                );
                if let Some((old_replicas, new_replicas)) = change.scaled() {
                    self.metrics.scaled.inc();
                    if log_events {
                        info!(cluster_id, name = %new.name, old_replicas, new_replicas, "Deployment scaled");
                    }
                }
                if let Some((old_image, new_image)) = change.image_changed() {
                    self.metrics.image_changes.inc();
                    if log_events {
                        info!(cluster_id, name = %new.name, old_image, new_image, "Deployment image updated");
                    }
                }
                if log_events {
                    info!(cluster_id, name = %new.name, namespace = %new.namespace, "Deployment updated");
                }
            }
            DeploymentEvent::Deleted(deleted) => {
                self.metrics.deleted.inc();
                let record = deleted.last_known();
                if let DeletedObject::FinalStateUnknown { key, .. } = deleted {
                    self.metrics.tombstones.inc();
                    debug!(cluster_id, %key, "Delete detected on relist, using last known state");
                }
                debug!(
                    cluster_id,
                    name = %record.name,
                    namespace = %record.namespace,
                    "Processing delete event"
                );
                if record.is_monitored() {
                    info!(cluster_id, name = %record.name, "Monitored deployment was deleted");
                }
                if log_events {
                    info!(cluster_id, name = %record.name, namespace = %record.namespace, "Deployment deleted");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::informer::types::fixtures::deployment;
    use crate::informer::types::fixtures::with_annotation;
    use crate::informer::types::MONITORED_ANNOTATION;

    fn informer(options: InformerOptions) -> DeploymentInformer {
        DeploymentInformer::new(
            "test-cluster".to_string(),
            options,
            Arc::new(ClusterMetrics::new("test-cluster").expect("metrics")),
        )
    }

    fn logging_informer() -> DeploymentInformer {
        informer(InformerOptions {
            enable_event_logging: true,
            ..Default::default()
        })
    }

    type WatchItem = Result<watcher::Event<Deployment>, watcher::Error>;

    #[test]
    fn initial_listing_syncs_store_and_phase() {
        let informer = logging_informer();
        assert_eq!(informer.phase(), InformerPhase::Initializing);

        let changes = informer.apply(watcher::Event::Restarted(vec![
            deployment("web", "d1", 3, "nginx:1", "1"),
            deployment("web", "d2", 1, "nginx:1", "1"),
        ]));

        assert_eq!(changes.len(), 2);
        assert_eq!(informer.phase(), InformerPhase::Synced);
        assert!(informer.store().has_synced());
        assert_eq!(informer.store().len(), 2);

        informer.apply(watcher::Event::Applied(deployment("web", "d3", 1, "nginx:1", "1")));
        assert_eq!(informer.phase(), InformerPhase::Watching);
    }

    #[test]
    fn reset_requires_a_fresh_sync() {
        let informer = logging_informer();
        informer.apply(watcher::Event::Restarted(vec![deployment(
            "web", "d1", 3, "nginx:1", "1",
        )]));
        assert_eq!(informer.phase(), InformerPhase::Synced);

        informer.reset();
        assert_eq!(informer.phase(), InformerPhase::Initializing);
        assert!(!informer.store().has_synced());
        assert!(informer.store().is_empty());
    }

    #[test]
    fn scale_update_is_applied_once() {
        let informer = logging_informer();
        informer.apply(watcher::Event::Restarted(vec![deployment(
            "web", "d1", 3, "nginx:1", "10",
        )]));

        let changes =
            informer.apply(watcher::Event::Applied(deployment("web", "d1", 5, "nginx:1", "11")));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].scaled(), Some((3, 5)));

        // Duplicate delivery of the same resource version.
        let duplicate =
            informer.apply(watcher::Event::Applied(deployment("web", "d1", 5, "nginx:1", "11")));
        assert!(duplicate.is_empty());

        let cached = informer.store().list("");
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].desired_replicas, 5);

        assert_eq!(informer.metrics.scaled.get(), 1, "exactly one scale observed");
        assert_eq!(informer.metrics.updated.get(), 1);
        assert_eq!(informer.metrics.image_changes.get(), 0);
    }

    #[test]
    fn resync_flood_is_idempotent() {
        let informer = informer(InformerOptions::default());
        let listing = vec![
            deployment("a", "x", 1, "img", "5"),
            deployment("b", "y", 2, "img", "6"),
        ];
        informer.apply(watcher::Event::Restarted(listing.clone()));

        let changes = informer.apply(watcher::Event::Restarted(listing));
        assert!(changes.is_empty());
        assert_eq!(informer.store().len(), 2);
        assert_eq!(informer.metrics.relists.get(), 2);
    }

    #[test]
    fn missed_delete_surfaces_as_tombstone() {
        let informer = informer(InformerOptions::default());
        informer.apply(watcher::Event::Restarted(vec![
            deployment("web", "kept", 1, "img", "1"),
            deployment("web", "missed", 1, "img", "1"),
        ]));

        let changes =
            informer.apply(watcher::Event::Restarted(vec![deployment("web", "kept", 1, "img", "1")]));

        assert_eq!(changes.len(), 1);
        match &changes[0] {
            DeploymentEvent::Deleted(deleted) => {
                assert!(deleted.is_tombstone());
                assert_eq!(deleted.last_known().name, "missed");
            }
            other => panic!("expected delete, got {other:?}"),
        }
        assert!(informer.store().get("web", "missed").is_none());
        assert_eq!(informer.metrics.tombstones.get(), 1);
    }

    #[test]
    fn delete_notification_removes_record() {
        let informer = logging_informer();
        let monitored = with_annotation(
            deployment("ops", "watched", 1, "img", "1"),
            MONITORED_ANNOTATION,
            "true",
        );
        informer.apply(watcher::Event::Restarted(vec![monitored.clone()]));

        let changes = informer.apply(watcher::Event::Deleted(monitored));
        assert!(matches!(
            changes.as_slice(),
            [DeploymentEvent::Deleted(DeletedObject::Observed(r))] if r.is_monitored()
        ));
        assert!(informer.store().is_empty());
    }

    #[test]
    fn malformed_objects_are_dropped() {
        let informer = informer(InformerOptions::default());
        let mut nameless = deployment("web", "x", 1, "img", "1");
        nameless.metadata.name = None;

        let changes = informer.apply(watcher::Event::Applied(nameless));
        assert!(changes.is_empty());
        assert!(informer.store().is_empty());
        assert_eq!(informer.metrics.dropped_objects.get(), 1);
    }

    #[test]
    fn watcher_config_pushes_selectors() {
        let informer = informer(InformerOptions {
            label_selector: Some("app=web".to_string()),
            field_selector: Some("metadata.name=api".to_string()),
            ..Default::default()
        });
        let config = informer.watcher_config();
        assert_eq!(config.label_selector.as_deref(), Some("app=web"));
        assert_eq!(config.field_selector.as_deref(), Some("metadata.name=api"));

        let unfiltered = informer_with_empty_selectors().watcher_config();
        assert_eq!(unfiltered.label_selector, None);
    }

    fn informer_with_empty_selectors() -> DeploymentInformer {
        informer(InformerOptions {
            label_selector: Some(String::new()),
            ..Default::default()
        })
    }

    #[test(tokio::test)]
    async fn process_stream_forwards_changes_in_order() {
        let informer = informer(InformerOptions::default());
        let (tx, mut rx) = mpsc::channel(16);
        let token = CancellationToken::new();

        let items: Vec<WatchItem> = vec![
            Ok(watcher::Event::Restarted(vec![deployment("web", "d1", 3, "img:1", "1")])),
            Ok(watcher::Event::Applied(deployment("web", "d1", 5, "img:1", "2"))),
            Ok(watcher::Event::Applied(deployment("web", "d1", 5, "img:1", "2"))),
            Ok(watcher::Event::Deleted(deployment("web", "d1", 5, "img:1", "3"))),
        ];
        let end = informer
            .process_stream(futures::stream::iter(items), &tx, &token)
            .await;
        assert_eq!(end, StreamEnd::Exhausted);
        drop(tx);

        let mut received = Vec::new();
        while let Some(change) = rx.recv().await {
            received.push(change);
        }
        assert_eq!(received.len(), 3);
        assert!(matches!(received[0], DeploymentEvent::Added(_)));
        assert!(matches!(received[1], DeploymentEvent::Updated { .. }));
        assert!(matches!(received[2], DeploymentEvent::Deleted(_)));
    }

    #[test(tokio::test)]
    async fn process_stream_stops_on_cancel() {
        let informer = informer(InformerOptions::default());
        let (tx, _rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        token.cancel();

        let end = informer
            .process_stream(futures::stream::pending::<WatchItem>(), &tx, &token)
            .await;
        assert_eq!(end, StreamEnd::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn process_stream_returns_for_resync() {
        let informer = informer(InformerOptions {
            resync_period: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let (tx, _rx) = mpsc::channel(1);
        let token = CancellationToken::new();

        let end = informer
            .process_stream(futures::stream::pending::<WatchItem>(), &tx, &token)
            .await;
        assert_eq!(end, StreamEnd::Resync);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_sync_times_out_without_listing() {
        let informer = informer(InformerOptions {
            sync_timeout: Duration::from_secs(2),
            ..Default::default()
        });

        let err = informer
            .wait_for_sync()
            .await
            .expect_err("no listing was applied");
        assert!(matches!(
            err.current_context(),
            InformerError::SyncTimeout { timeout_secs: 2 }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_sync_ignores_a_previous_run() {
        let informer = informer(InformerOptions {
            sync_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        informer.apply(watcher::Event::Restarted(Vec::new()));
        informer.wait_for_sync().await.expect("first run synced");

        informer.reset();
        let err = informer
            .wait_for_sync()
            .await
            .expect_err("second run has not listed yet");
        assert!(matches!(
            err.current_context(),
            InformerError::SyncTimeout { .. }
        ));
    }

    #[tokio::test]
    async fn wait_for_sync_completes_after_listing() {
        let informer = Arc::new(informer(InformerOptions::default()));
        let waiter = {
            let informer = informer.clone();
            tokio::spawn(async move { informer.wait_for_sync().await })
        };

        informer.apply(watcher::Event::Restarted(Vec::new()));
        waiter
            .await
            .expect("waiter task should not panic")
            .expect("sync should complete");
    }
}
