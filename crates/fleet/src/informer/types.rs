use core::error::Error;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use api_types::DeploymentDetail;
use api_types::DeploymentItem;
use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;
use k8s_openapi::api::apps::v1::Deployment;

/// Annotation marking deployments that deserve an extra lifecycle log line.
pub const MONITORED_ANNOTATION: &str = "custom-controller/monitored";

/// Errors raised by the deployment informer.
#[derive(Debug, derive_more::Display)]
pub enum InformerError {
    #[display("Timed out after {timeout_secs}s waiting for deployment cache to sync")]
    SyncTimeout { timeout_secs: u64 },
    #[display("Informer stopped before the cache synced")]
    Stopped,
    #[display("Malformed deployment object: {message}")]
    MalformedObject { message: String },
    #[display("Invalid label selector: {message}")]
    InvalidSelector { message: String },
}

impl Error for InformerError {}

/// Cache key of a namespaced object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Point-in-time snapshot of a Deployment as held in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub name: String,
    pub namespace: String,
    /// `spec.replicas`, defaulting to 1 like the API server does
    pub desired_replicas: i32,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub available_replicas: i32,
    /// Image of the first container in the pod template
    pub image: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub resource_version: Option<String>,
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl DeploymentRecord {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn is_monitored(&self) -> bool {
        self.annotations
            .get(MONITORED_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    pub fn image_or_unknown(&self) -> &str {
        self.image.as_deref().unwrap_or("<unknown>")
    }

    pub fn to_item(&self) -> DeploymentItem {
        DeploymentItem {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            desired: self.desired_replicas,
            replicas: self.replicas,
            ready: self.ready_replicas,
            available: self.available_replicas,
        }
    }

    pub fn to_detail(&self, cluster_id: &str) -> DeploymentDetail {
        DeploymentDetail {
            cluster_id: cluster_id.to_string(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            desired_replicas: self.desired_replicas,
            replicas: self.replicas,
            ready_replicas: self.ready_replicas,
            available_replicas: self.available_replicas,
            image: self.image.clone(),
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
            resource_version: self.resource_version.clone(),
            created: self.creation_timestamp.map(|ts| ts.to_rfc3339()),
        }
    }
}

impl TryFrom<&Deployment> for DeploymentRecord {
    type Error = Report<InformerError>;

    fn try_from(deployment: &Deployment) -> Result<Self, Self::Error> {
        let metadata = &deployment.metadata;
        let name = metadata.name.clone().ok_or_else(|| {
            Report::new(InformerError::MalformedObject {
                message: "deployment has no metadata.name".to_string(),
            })
        })?;
        let namespace = metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let spec = deployment.spec.as_ref();
        let status = deployment.status.as_ref();
        let image = spec
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|pod| pod.containers.first())
            .and_then(|c| c.image.clone());

        Ok(Self {
            name,
            namespace,
            desired_replicas: spec.and_then(|s| s.replicas).unwrap_or(1),
            replicas: status.and_then(|s| s.replicas).unwrap_or(0),
            ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
            available_replicas: status.and_then(|s| s.available_replicas).unwrap_or(0),
            image,
            labels: metadata.labels.clone().unwrap_or_default(),
            annotations: metadata.annotations.clone().unwrap_or_default(),
            resource_version: metadata.resource_version.clone(),
            creation_timestamp: metadata.creation_timestamp.as_ref().map(|t| t.0),
        })
    }
}

/// Object carried by a delete notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletedObject {
    /// The watch delivered the delete with the final object.
    Observed(Arc<DeploymentRecord>),
    /// The delete was missed and detected on relist; only the last cached
    /// state is known.
    FinalStateUnknown {
        key: ObjectKey,
        last_known: Arc<DeploymentRecord>,
    },
}

impl DeletedObject {
    pub fn last_known(&self) -> &Arc<DeploymentRecord> {
        match self {
            Self::Observed(record) => record,
            Self::FinalStateUnknown { last_known, .. } => last_known,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::FinalStateUnknown { .. })
    }
}

/// Change notification produced by applying a watch event to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentEvent {
    Added(Arc<DeploymentRecord>),
    Updated {
        old: Arc<DeploymentRecord>,
        new: Arc<DeploymentRecord>,
    },
    Deleted(DeletedObject),
}

impl DeploymentEvent {
    pub fn key(&self) -> ObjectKey {
        match self {
            Self::Added(record) => record.key(),
            Self::Updated { new, .. } => new.key(),
            Self::Deleted(DeletedObject::FinalStateUnknown { key, .. }) => key.clone(),
            Self::Deleted(DeletedObject::Observed(record)) => record.key(),
        }
    }

    /// Desired replica change carried by an update, if any.
    pub fn scaled(&self) -> Option<(i32, i32)> {
        match self {
            Self::Updated { old, new } if old.desired_replicas != new.desired_replicas => {
                Some((old.desired_replicas, new.desired_replicas))
            }
            _ => None,
        }
    }

    /// First-container image change carried by an update, if any.
    pub fn image_changed(&self) -> Option<(&str, &str)> {
        match self {
            Self::Updated { old, new } if old.image != new.image => {
                Some((old.image_or_unknown(), new.image_or_unknown()))
            }
            _ => None,
        }
    }
}
