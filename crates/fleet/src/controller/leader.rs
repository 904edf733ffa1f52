use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::coordination::v1::LeaseSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use kube::api::PostParams;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::metrics::ClusterMetrics;

/// Lease parameters for one controller instance.
#[derive(Debug, Clone)]
pub struct LeaderElectionSettings {
    pub lease_name: String,
    pub namespace: String,
    /// Identity written into `spec.holderIdentity`
    pub holder_id: String,
    pub lease_duration: Duration,
    pub renew_interval: Duration,
}

impl LeaderElectionSettings {
    pub fn new(lease_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            lease_name: lease_name.into(),
            namespace: namespace.into(),
            holder_id: default_holder_id(),
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
        }
    }

    fn lease_duration_secs(&self) -> i32 {
        i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }
}

/// Pod name when running in a pod, a random identity otherwise.
pub fn default_holder_id() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| format!("fleet-{}", uuid::Uuid::new_v4()))
}

/// What to do with the Lease on this round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAction {
    /// No Lease exists yet
    Create,
    /// We hold it; bump the renew time
    Renew,
    /// Unheld or expired; claim it
    Takeover,
    /// Someone else holds a live Lease
    Wait { holder: String },
}

/// Decide the next action from the current Lease state.
pub fn decide(
    lease: Option<&Lease>,
    holder_id: &str,
    now: DateTime<Utc>,
    default_duration: Duration,
) -> LeaseAction {
    let Some(lease) = lease else {
        return LeaseAction::Create;
    };
    let spec = lease.spec.as_ref();
    let holder = spec
        .and_then(|s| s.holder_identity.as_deref())
        .filter(|h| !h.is_empty());

    let Some(holder) = holder else {
        return LeaseAction::Takeover;
    };
    if holder == holder_id {
        return LeaseAction::Renew;
    }

    let duration = spec
        .and_then(|s| s.lease_duration_seconds)
        .and_then(|secs| u64::try_from(secs).ok())
        .map(Duration::from_secs)
        .unwrap_or(default_duration);
    let last_renewed = spec.and_then(|s| s.renew_time.as_ref().or(s.acquire_time.as_ref()));

    let expired = match last_renewed {
        Some(MicroTime(renewed)) => {
            let secs = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX / 1000);
            renewed
                .checked_add_signed(chrono::Duration::seconds(secs))
                .is_some_and(|expiry| expiry < now)
        }
        None => true,
    };

    if expired {
        LeaseAction::Takeover
    } else {
        LeaseAction::Wait {
            holder: holder.to_string(),
        }
    }
}

/// Try to become or stay leader. Returns whether we hold the Lease afterwards.
///
/// Write conflicts mean another instance won the race and yield `Ok(false)`.
pub async fn try_acquire_or_renew(
    api: &Api<Lease>,
    settings: &LeaderElectionSettings,
) -> Result<bool, kube::Error> {
    let now = Utc::now();
    let existing = api.get_opt(&settings.lease_name).await?;

    let result = match decide(
        existing.as_ref(),
        &settings.holder_id,
        now,
        settings.lease_duration,
    ) {
        LeaseAction::Create => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(settings.lease_name.clone()),
                    namespace: Some(settings.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(settings.holder_id.clone()),
                    lease_duration_seconds: Some(settings.lease_duration_secs()),
                    lease_transitions: Some(0),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                }),
            };
            api.create(&PostParams::default(), &lease).await.map(|_| true)
        }
        LeaseAction::Renew => {
            let Some(mut lease) = existing else {
                return Ok(false);
            };
            let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
            spec.renew_time = Some(MicroTime(now));
            spec.lease_duration_seconds = Some(settings.lease_duration_secs());
            api.replace(&settings.lease_name, &PostParams::default(), &lease)
                .await
                .map(|_| true)
        }
        LeaseAction::Takeover => {
            let Some(mut lease) = existing else {
                return Ok(false);
            };
            let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
            let transitions = spec.lease_transitions.unwrap_or(0);
            spec.holder_identity = Some(settings.holder_id.clone());
            spec.lease_transitions = Some(transitions + 1);
            spec.lease_duration_seconds = Some(settings.lease_duration_secs());
            spec.acquire_time = Some(MicroTime(now));
            spec.renew_time = Some(MicroTime(now));
            api.replace(&settings.lease_name, &PostParams::default(), &lease)
                .await
                .map(|_| true)
        }
        LeaseAction::Wait { holder } => {
            debug!(holder = %holder, lease = %settings.lease_name, "Lease held by another instance");
            Ok(false)
        }
    };

    match result {
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!(lease = %settings.lease_name, "Conflict updating lease, will retry");
            Ok(false)
        }
        other => other,
    }
}

/// Lease based leader election loop for one cluster controller.
pub struct LeaderElector {
    cluster_id: String,
    api: Api<Lease>,
    settings: LeaderElectionSettings,
    status: watch::Sender<bool>,
    metrics: Arc<ClusterMetrics>,
}

impl LeaderElector {
    pub fn new(
        cluster_id: impl Into<String>,
        client: kube::Client,
        settings: LeaderElectionSettings,
        metrics: Arc<ClusterMetrics>,
    ) -> Self {
        let api = Api::namespaced(client, &settings.namespace);
        let (status, _) = watch::channel(false);
        Self {
            cluster_id: cluster_id.into(),
            api,
            settings,
            status,
            metrics,
        }
    }

    /// Leadership updates; starts out as not leader.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }

    fn publish(&self, leader: bool) {
        let was_leader = *self.status.borrow();
        if leader && !was_leader {
            info!(
                cluster_id = %self.cluster_id,
                holder = %self.settings.holder_id,
                lease = %self.settings.lease_name,
                "Acquired leadership"
            );
        } else if !leader && was_leader {
            warn!(
                cluster_id = %self.cluster_id,
                holder = %self.settings.holder_id,
                "Lost leadership"
            );
        }
        self.status.send_replace(leader);
        self.metrics.set_leader(leader);
    }

    /// Acquire and renew until `token` is cancelled, then release the Lease if
    /// we still hold it.
    #[tracing::instrument(skip_all, fields(cluster_id = %self.cluster_id))]
    pub async fn run(self, token: CancellationToken) {
        info!(
            lease = %self.settings.lease_name,
            namespace = %self.settings.namespace,
            holder = %self.settings.holder_id,
            "Starting leader election"
        );
        let mut ticker = tokio::time::interval(self.settings.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match try_acquire_or_renew(&self.api, &self.settings).await {
                        Ok(leader) => self.publish(leader),
                        Err(e) => {
                            warn!("Leader election error: {e}");
                            self.publish(false);
                        }
                    }
                }
            }
        }

        if *self.status.borrow() {
            self.step_down().await;
        }
        self.publish(false);
    }

    /// Release the Lease so another instance can take over without waiting
    /// for expiry.
    async fn step_down(&self) {
        let lease = match self.api.get_opt(&self.settings.lease_name).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return,
            Err(e) => {
                debug!("Could not read lease for step-down: {e}");
                return;
            }
        };

        let held = lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            == Some(self.settings.holder_id.as_str());
        if !held {
            return;
        }

        let mut released = lease;
        if let Some(spec) = released.spec.as_mut() {
            spec.holder_identity = None;
            spec.lease_duration_seconds = Some(1);
        }
        match self
            .api
            .replace(&self.settings.lease_name, &PostParams::default(), &released)
            .await
        {
            Ok(_) => info!("Stepped down from leadership"),
            Err(e) => warn!("Failed to step down: {e}"),
        }
    }
}
