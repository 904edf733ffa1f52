use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use api_types::ClusterConfig;
use api_types::LeaderElectionConfig;
use clap::Parser;
use utils::logging::LogFormat;

use crate::controller::client::ClientOptions;
use crate::controller::ControllerSettings;
use crate::informer::InformerOptions;
use crate::limiter::RateLimiterConfig;

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "API_LISTEN_ADDR",
        default_value = "0.0.0.0:8080",
        help = "HTTP API server listen address"
    )]
    pub api_listen_addr: String,

    #[arg(
        long,
        help = "Enable the HTTP API server",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_api: bool,

    #[arg(
        long,
        env = "RATE_LIMIT_RPS",
        default_value_t = 100,
        help = "Requests per second allowed per client IP, 0 disables rate limiting"
    )]
    pub rate_limit_rps: u32,

    #[arg(
        long,
        default_value_t = 300,
        help = "Interval between rate limiter table cleanups"
    )]
    pub rate_limit_cleanup_interval_secs: u64,

    #[arg(
        long,
        default_value_t = 1000,
        help = "Number of tracked clients above which the rate limiter table is cleared"
    )]
    pub rate_limit_max_clients: usize,

    #[arg(
        long,
        help = "Cluster served by /deployments when no cluster is requested (defaults to the primary cluster)"
    )]
    pub default_cluster: Option<String>,

    #[arg(
        long,
        help = "Register the cluster described by the kubeconfig/in-cluster flags",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_primary_cluster: bool,

    #[arg(long, default_value = "primary-cluster", help = "Id of the primary cluster")]
    pub primary_cluster_id: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, help = "Context inside the kubeconfig file")]
    pub kube_context: Option<String>,

    #[arg(
        long,
        help = "Use the in-cluster service account for the primary cluster",
        default_value_t = false
    )]
    pub in_cluster: bool,

    #[arg(long, help = "Kubernetes namespace to watch (empty for all namespaces)")]
    pub namespace: Option<String>,

    #[arg(
        long,
        env = "CLUSTERS_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML list of additional cluster configurations"
    )]
    pub clusters_file: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = 600,
        help = "Full relist period for deployment informers, 0 disables resync"
    )]
    pub resync_period_secs: u64,

    #[arg(
        long,
        default_value_t = 30,
        help = "Timeout for the initial deployment cache sync"
    )]
    pub sync_timeout_secs: u64,

    #[arg(long, help = "Label selector applied to the deployment watch")]
    pub label_selector: Option<String>,

    #[arg(long, help = "Field selector applied to the deployment watch")]
    pub field_selector: Option<String>,

    #[arg(
        long,
        help = "Log every deployment add, update and delete",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub enable_event_logging: bool,

    #[arg(
        long,
        default_value_t = 256,
        help = "Capacity of the per-cluster event channel"
    )]
    pub event_buffer: usize,

    #[arg(
        long,
        default_value_t = 30,
        help = "Timeout for connecting to the Kubernetes API"
    )]
    pub connect_timeout_secs: u64,

    #[arg(
        long,
        help = "Gate primary cluster reconciliation on a Lease",
        default_value_t = false
    )]
    pub leader_elect: bool,

    #[arg(long, default_value = "kube-system", help = "Namespace of the leader election Lease")]
    pub leader_election_namespace: String,

    #[arg(long, default_value = "fleet-controller", help = "Name of the leader election Lease")]
    pub leader_election_id: String,

    #[arg(long, default_value_t = 15, help = "Lease validity in seconds")]
    pub lease_duration_secs: u64,

    #[arg(long, default_value_t = 5, help = "Lease renewal interval in seconds")]
    pub lease_renew_interval_secs: u64,

    #[arg(
        long,
        help = "Metrics endpoint address for the primary cluster (empty disables)"
    )]
    pub metrics_bind_address: Option<String>,

    #[arg(
        long,
        default_value_t = 5,
        help = "Time to wait for tasks to stop on shutdown"
    )]
    pub shutdown_timeout_secs: u64,

    #[arg(
        long,
        env = "LOG_FORMAT",
        default_value_t = LogFormat::Text,
        help = "Log output format, either 'text' or 'json'"
    )]
    pub log_format: LogFormat,
}

impl DaemonArgs {
    /// Settings shared by every cluster controller.
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            informer: InformerOptions {
                namespace: None,
                label_selector: self.label_selector.clone(),
                field_selector: self.field_selector.clone(),
                resync_period: (self.resync_period_secs > 0)
                    .then(|| Duration::from_secs(self.resync_period_secs)),
                sync_timeout: Duration::from_secs(self.sync_timeout_secs),
                enable_event_logging: self.enable_event_logging,
            },
            client: ClientOptions {
                connect_timeout: Some(Duration::from_secs(self.connect_timeout_secs)),
            },
            event_buffer: self.event_buffer,
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            lease_renew_interval: Duration::from_secs(self.lease_renew_interval_secs),
            default_lease_namespace: self.leader_election_namespace.clone(),
            default_lease_id: self.leader_election_id.clone(),
        }
    }

    /// The cluster described by the top-level connection flags, if enabled.
    pub fn primary_cluster(&self) -> Option<ClusterConfig> {
        if !self.enable_primary_cluster {
            return None;
        }

        Some(ClusterConfig {
            cluster_id: self.primary_cluster_id.clone(),
            name: Some("primary".to_string()),
            kubeconfig: self
                .kubeconfig
                .as_ref()
                .map(|path| path.display().to_string()),
            context: self.kube_context.clone(),
            in_cluster: self.in_cluster,
            namespace: self.namespace.clone(),
            leader_election: LeaderElectionConfig {
                enabled: self.leader_elect,
                namespace: Some(self.leader_election_namespace.clone()),
                id: Some(self.leader_election_id.clone()),
            },
            metrics_bind_address: self
                .metrics_bind_address
                .clone()
                .filter(|addr| !addr.is_empty()),
        })
    }

    /// Rate limiter settings, `None` when limiting is disabled.
    pub fn rate_limiter_config(&self) -> Option<RateLimiterConfig> {
        let rate = NonZeroU32::new(self.rate_limit_rps)?;
        Some(RateLimiterConfig {
            rate,
            cleanup_interval: Duration::from_secs(self.rate_limit_cleanup_interval_secs.max(1)),
            max_clients: self.rate_limit_max_clients,
        })
    }

    /// Cluster whose cache `/deployments` reads by default.
    pub fn default_cluster(&self) -> Option<String> {
        self.default_cluster
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| {
                self.enable_primary_cluster
                    .then(|| self.primary_cluster_id.clone())
            })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
