use std::path::PathBuf;
use std::time::Duration;

use api_types::ClusterConfig;
use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;
use tracing::info;

use super::ControllerError;

/// Where a cluster's credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Mounted service account of the pod we run in
    InCluster,
    /// Explicit kubeconfig file, optionally pinned to a context
    Kubeconfig {
        path: PathBuf,
        context: Option<String>,
    },
    /// `KUBECONFIG`, `~/.kube/config` or the in-cluster environment, in that
    /// order
    Inferred { context: Option<String> },
}

impl CredentialSource {
    /// Resolve the credential source described by `config`.
    ///
    /// # Errors
    ///
    /// - [`ControllerError::InvalidConfig`] if both a kubeconfig path and the
    ///   in-cluster flag are set
    pub fn from_config(config: &ClusterConfig) -> Result<Self, Report<ControllerError>> {
        let kubeconfig = config.kubeconfig.as_deref().filter(|p| !p.is_empty());
        let context = config.context.clone().filter(|c| !c.is_empty());

        match (config.in_cluster, kubeconfig) {
            (true, Some(path)) => Err(Report::new(ControllerError::InvalidConfig {
                message: "kubeconfig and in_cluster are mutually exclusive".to_string(),
            })
            .attach_printable(format!("cluster {} kubeconfig {path}", config.cluster_id))),
            (true, None) => Ok(Self::InCluster),
            (false, Some(path)) => Ok(Self::Kubeconfig {
                path: PathBuf::from(path),
                context,
            }),
            (false, None) => Ok(Self::Inferred { context }),
        }
    }
}

/// Client tuning shared by every cluster.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub connect_timeout: Option<Duration>,
}

/// Build a Kubernetes client for `source`.
///
/// # Errors
///
/// - [`ControllerError::ConnectionFailed`] if the credentials cannot be
///   loaded or the client cannot be constructed
pub async fn init_kube_client(
    source: &CredentialSource,
    options: &ClientOptions,
) -> Result<Client, Report<ControllerError>> {
    let mut config = match source {
        CredentialSource::InCluster => {
            info!("Using in-cluster configuration");
            Config::incluster().change_context(ControllerError::ConnectionFailed {
                message: "Failed to load in-cluster configuration".to_string(),
            })?
        }
        CredentialSource::Kubeconfig { path, context } => {
            info!(kubeconfig = %path.display(), context = ?context, "Using kubeconfig file");
            let kubeconfig = Kubeconfig::read_from(path).change_context(
                ControllerError::ConnectionFailed {
                    message: format!("Failed to read kubeconfig file: {}", path.display()),
                },
            )?;

            let kube_options = KubeConfigOptions {
                context: context.clone(),
                ..Default::default()
            };
            Config::from_custom_kubeconfig(kubeconfig, &kube_options)
                .await
                .change_context(ControllerError::ConnectionFailed {
                    message: format!(
                        "Failed to create config from kubeconfig: {}",
                        path.display()
                    ),
                })?
        }
        CredentialSource::Inferred { context: Some(context) } => {
            let kube_options = KubeConfigOptions {
                context: Some(context.clone()),
                ..Default::default()
            };
            Config::from_kubeconfig(&kube_options)
                .await
                .change_context(ControllerError::ConnectionFailed {
                    message: format!("Failed to load default kubeconfig with context {context}"),
                })?
        }
        CredentialSource::Inferred { context: None } => {
            // Use default configuration (in-cluster or ~/.kube/config)
            Config::infer()
                .await
                .change_context(ControllerError::ConnectionFailed {
                    message: "Failed to infer Kubernetes configuration".to_string(),
                })?
        }
    };

    if let Some(timeout) = options.connect_timeout {
        config.connect_timeout = Some(timeout);
    }

    Client::try_from(config).change_context(ControllerError::ConnectionFailed {
        message: "Failed to create Kubernetes client".to_string(),
    })
}
