//! Per-cluster controller metrics on a dedicated Prometheus registry.

use std::collections::HashMap;

use prometheus::Encoder;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;

pub mod server;

/// Metrics of one cluster controller.
///
/// Every series carries a constant `cluster_id` label from the registry, so
/// controllers never share state.
pub struct ClusterMetrics {
    registry: Registry,
    pub(crate) added: IntCounter,
    pub(crate) updated: IntCounter,
    pub(crate) deleted: IntCounter,
    pub(crate) tombstones: IntCounter,
    pub(crate) scaled: IntCounter,
    pub(crate) image_changes: IntCounter,
    pub(crate) dropped_objects: IntCounter,
    pub(crate) watch_errors: IntCounter,
    pub(crate) relists: IntCounter,
    pub(crate) audit_events: IntCounter,
    pub(crate) leader: IntGauge,
    cache_deployments: IntGauge,
    cache_synced: IntGauge,
}

impl ClusterMetrics {
    /// Create and register every metric for `cluster_id`.
    ///
    /// # Errors
    ///
    /// Returns the registry error if a metric cannot be created or
    /// registered.
    pub fn new(cluster_id: &str) -> prometheus::Result<Self> {
        let labels = HashMap::from([("cluster_id".to_string(), cluster_id.to_string())]);
        let registry = Registry::new_custom(None, Some(labels))?;

        let events = IntCounterVec::new(
            Opts::new(
                "fleet_deployment_events_total",
                "Deployment notifications applied to the cache.",
            ),
            &["event"],
        )?;
        registry.register(Box::new(events.clone()))?;

        Ok(Self {
            added: events.with_label_values(&["added"]),
            updated: events.with_label_values(&["updated"]),
            deleted: events.with_label_values(&["deleted"]),
            tombstones: counter(
                &registry,
                "fleet_deployment_tombstones_total",
                "Deletes detected on relist without a watch notification.",
            )?,
            scaled: counter(
                &registry,
                "fleet_deployment_scaled_total",
                "Updates that changed the desired replica count.",
            )?,
            image_changes: counter(
                &registry,
                "fleet_deployment_image_changes_total",
                "Updates that changed the first container image.",
            )?,
            dropped_objects: counter(
                &registry,
                "fleet_dropped_objects_total",
                "Watch objects dropped because they could not be decoded.",
            )?,
            watch_errors: counter(
                &registry,
                "fleet_watch_errors_total",
                "Transient watch stream errors.",
            )?,
            relists: counter(
                &registry,
                "fleet_relists_total",
                "Full relists applied to the cache.",
            )?,
            audit_events: counter(
                &registry,
                "fleet_audit_events_total",
                "Audit records emitted by the reconcile loop.",
            )?,
            leader: gauge(
                &registry,
                "fleet_leader",
                "Whether this instance currently holds the leader lease.",
            )?,
            cache_deployments: gauge(
                &registry,
                "fleet_cache_deployments",
                "Deployments currently held in the cache.",
            )?,
            cache_synced: gauge(
                &registry,
                "fleet_cache_synced",
                "Whether the cache completed its initial listing.",
            )?,
            registry,
        })
    }

    pub(crate) fn set_leader(&self, leader: bool) {
        self.leader.set(i64::from(leader));
    }

    /// Refresh the cache gauges and render the registry in the Prometheus
    /// text format.
    ///
    /// # Errors
    ///
    /// Returns the encoder error if the metric families cannot be written.
    pub fn encode(&self, cache_size: usize, synced: bool) -> prometheus::Result<String> {
        self.cache_deployments
            .set(i64::try_from(cache_size).unwrap_or(i64::MAX));
        self.cache_synced.set(i64::from(synced));

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}
