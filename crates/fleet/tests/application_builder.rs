use std::io::Write;
use std::sync::Arc;

use api_types::ClusterConfig;
use async_trait::async_trait;
use clap::Parser;
use error_stack::Report;
use fleet::app::ApplicationBuilder;
use fleet::config::DaemonArgs;
use fleet::controller::ClusterRunner;
use fleet::controller::ControllerError;
use fleet::controller::ControllerFactory;
use fleet::informer::DeploymentStore;
use similar_asserts::assert_eq;
use tokio_util::sync::CancellationToken;

struct NoopRunner {
    cluster_id: String,
}

#[async_trait]
impl ClusterRunner for NoopRunner {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn store(&self) -> Option<DeploymentStore> {
        Some(DeploymentStore::new())
    }

    async fn run(&self, token: CancellationToken) -> Result<(), Report<ControllerError>> {
        token.cancelled().await;
        Ok(())
    }
}

struct NoopFactory;

impl ControllerFactory for NoopFactory {
    fn build(
        &self,
        config: Arc<ClusterConfig>,
    ) -> Result<Arc<dyn ClusterRunner>, Report<ControllerError>> {
        Ok(Arc::new(NoopRunner {
            cluster_id: config.cluster_id.clone(),
        }))
    }
}

fn args(extra: &[&str]) -> DaemonArgs {
    let mut argv = vec!["daemon", "--enable-api", "false"];
    argv.extend_from_slice(extra);
    DaemonArgs::try_parse_from(argv).expect("valid arguments")
}

fn clusters_file(yaml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(yaml.as_bytes()).expect("write clusters file");
    file
}

#[test]
fn registers_primary_and_file_clusters() {
    let file = clusters_file("- cluster_id: edge-1\n  namespace: apps\n- cluster_id: edge-2\n");
    let path = file.path().display().to_string();

    let app = ApplicationBuilder::new(args(&[
        "--primary-cluster-id",
        "home",
        "--clusters-file",
        &path,
        "--rate-limit-rps",
        "5",
    ]))
    .with_factory(Arc::new(NoopFactory))
    .build()
    .expect("application builds");

    let manager = &app.services().manager;
    assert_eq!(
        manager.get_clusters().keys().cloned().collect::<Vec<_>>(),
        vec!["edge-1".to_string(), "edge-2".to_string(), "home".to_string()]
    );
    assert_eq!(
        manager.get_clusters()["edge-1"].watched_namespace(),
        Some("apps")
    );

    let limiter = app.services().rate_limiter.as_ref().expect("limiter enabled");
    assert_eq!(limiter.rate(), 5);
}

#[test]
fn primary_cluster_and_rate_limit_can_be_disabled() {
    let app = ApplicationBuilder::new(args(&[
        "--enable-primary-cluster",
        "false",
        "--rate-limit-rps",
        "0",
    ]))
    .with_factory(Arc::new(NoopFactory))
    .build()
    .expect("application builds");

    assert_eq!(app.services().manager.get_cluster_count(), 0);
    assert!(app.services().rate_limiter.is_none());
}

#[test]
fn duplicate_cluster_ids_fail_the_build() {
    let file = clusters_file("- cluster_id: home\n");
    let path = file.path().display().to_string();

    let result = ApplicationBuilder::new(args(&[
        "--primary-cluster-id",
        "home",
        "--clusters-file",
        &path,
    ]))
    .with_factory(Arc::new(NoopFactory))
    .build();

    let err = result.err().expect("duplicate id rejected");
    assert!(err.to_string().contains("home"), "{err}");
}

#[test]
fn unreadable_clusters_file_fails_the_build() {
    let result = ApplicationBuilder::new(args(&["--clusters-file", "/nonexistent/clusters.yaml"]))
        .with_factory(Arc::new(NoopFactory))
        .build();
    assert!(result.is_err());
}
