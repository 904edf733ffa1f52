use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use uuid::Uuid;

use crate::informer::DeploymentEvent;
use crate::metrics::ClusterMetrics;

pub const RESOURCE_TYPE: &str = "Deployment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum AuditEventType {
    #[display("CREATE")]
    Create,
    #[display("UPDATE")]
    Update,
    #[display("DELETE")]
    Delete,
}

/// One audited change of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub event_id: Uuid,
    pub cluster_id: String,
    pub event_type: AuditEventType,
    pub namespace: String,
    pub name: String,
    /// Desired replicas after the change, or the last known count on delete
    pub replicas: i32,
    /// Set only when the change altered the desired replica count
    pub old_replicas: Option<i32>,
}

impl AuditRecord {
    pub fn from_event(cluster_id: &str, event: &DeploymentEvent) -> Self {
        let (event_type, record, old_replicas) = match event {
            DeploymentEvent::Added(record) => (AuditEventType::Create, record, None),
            DeploymentEvent::Updated { new, .. } => (
                AuditEventType::Update,
                new,
                event.scaled().map(|(old, _)| old),
            ),
            DeploymentEvent::Deleted(deleted) => {
                (AuditEventType::Delete, deleted.last_known(), None)
            }
        };

        Self {
            event_id: Uuid::new_v4(),
            cluster_id: cluster_id.to_string(),
            event_type,
            namespace: record.namespace.clone(),
            name: record.name.clone(),
            replicas: record.desired_replicas,
            old_replicas,
        }
    }

    pub fn log(&self) {
        match (self.event_type, self.old_replicas) {
            (AuditEventType::Update, Some(old_replicas)) => info!(
                event_id = %self.event_id,
                cluster_id = %self.cluster_id,
                event_type = %self.event_type,
                resource_type = RESOURCE_TYPE,
                namespace = %self.namespace,
                name = %self.name,
                old_replicas,
                new_replicas = self.replicas,
                "Deployment replicas changed"
            ),
            (event_type, _) => {
                let message = match event_type {
                    AuditEventType::Create => "Deployment created",
                    AuditEventType::Update => "Deployment updated",
                    AuditEventType::Delete => "Deployment deleted",
                };
                info!(
                    event_id = %self.event_id,
                    cluster_id = %self.cluster_id,
                    event_type = %event_type,
                    resource_type = RESOURCE_TYPE,
                    namespace = %self.namespace,
                    name = %self.name,
                    replicas = self.replicas,
                    "{message}"
                );
            }
        }
    }
}

/// Reconcile loop consuming a cluster's cache changes.
///
/// Changes are audited only while `leader` reads `true`; the cache itself
/// keeps being maintained by the informer regardless.
pub struct AuditLogger {
    cluster_id: String,
    leader: watch::Receiver<bool>,
    metrics: Arc<ClusterMetrics>,
}

impl AuditLogger {
    pub fn new(
        cluster_id: impl Into<String>,
        leader: watch::Receiver<bool>,
        metrics: Arc<ClusterMetrics>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            leader,
            metrics,
        }
    }

    /// Audit one change, returning the emitted record.
    pub fn handle(&self, event: &DeploymentEvent) -> Option<AuditRecord> {
        if !*self.leader.borrow() {
            debug!(
                cluster_id = %self.cluster_id,
                key = %event.key(),
                "Not leader, skipping audit"
            );
            return None;
        }

        let record = AuditRecord::from_event(&self.cluster_id, event);
        record.log();
        self.metrics.audit_events.inc();
        Some(record)
    }

    /// Consume `events` until `token` is cancelled or every sender is gone.
    #[tracing::instrument(skip_all, fields(cluster_id = %self.cluster_id))]
    pub async fn run(self, mut events: mpsc::Receiver<DeploymentEvent>, token: CancellationToken) {
        debug!("Audit loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle(&event);
                    }
                    None => break,
                },
            }
        }
        debug!("Audit loop stopped");
    }
}
