use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use api_types::ClusterConfig;
use async_trait::async_trait;
use error_stack::Report;
use fleet::controller::ClusterRunner;
use fleet::controller::ControllerError;
use fleet::controller::ControllerFactory;
use fleet::controller::ControllerState;
use fleet::informer::DeploymentStore;
use fleet::manager::ManagerError;
use fleet::manager::MultiClusterManager;
use similar_asserts::assert_eq;
use test_log::test;
use tokio_util::sync::CancellationToken;

/// How a mock controller behaves once started.
#[derive(Clone, Copy)]
enum Behavior {
    /// Run until cancelled
    Idle,
    /// Fail after the given delay
    FailAfter(Duration),
}

#[derive(Default)]
struct RunCounter {
    started: AtomicUsize,
    stopped: AtomicUsize,
}

struct MockRunner {
    cluster_id: String,
    behavior: Behavior,
    counter: Arc<RunCounter>,
}

#[async_trait]
impl ClusterRunner for MockRunner {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn store(&self) -> Option<DeploymentStore> {
        None
    }

    async fn run(&self, token: CancellationToken) -> Result<(), Report<ControllerError>> {
        self.counter.started.fetch_add(1, Ordering::SeqCst);
        let result = match self.behavior {
            Behavior::Idle => {
                token.cancelled().await;
                // Simulate teardown work after cancellation.
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            }
            Behavior::FailAfter(delay) => {
                tokio::select! {
                    _ = token.cancelled() => Ok(()),
                    _ = tokio::time::sleep(delay) => Err(Report::new(ControllerError::ConnectionFailed {
                        message: format!("{} unreachable", self.cluster_id),
                    })),
                }
            }
        };
        self.counter.stopped.fetch_add(1, Ordering::SeqCst);
        result
    }
}

/// Builds mock runners, `Idle` unless a behavior was registered for the id.
#[derive(Default)]
struct MockFactory {
    behaviors: Mutex<HashMap<String, Behavior>>,
    counters: Mutex<HashMap<String, Arc<RunCounter>>>,
}

impl MockFactory {
    fn with_behavior(self, cluster_id: &str, behavior: Behavior) -> Self {
        self.behaviors
            .lock()
            .expect("poisoned")
            .insert(cluster_id.to_string(), behavior);
        self
    }

    fn counter(&self, cluster_id: &str) -> Arc<RunCounter> {
        self.counters
            .lock()
            .expect("poisoned")
            .get(cluster_id)
            .cloned()
            .expect("runner built for cluster")
    }
}

impl ControllerFactory for MockFactory {
    fn build(
        &self,
        config: Arc<ClusterConfig>,
    ) -> Result<Arc<dyn ClusterRunner>, Report<ControllerError>> {
        let behavior = self
            .behaviors
            .lock()
            .expect("poisoned")
            .get(&config.cluster_id)
            .copied()
            .unwrap_or(Behavior::Idle);
        let counter = Arc::new(RunCounter::default());
        self.counters
            .lock()
            .expect("poisoned")
            .insert(config.cluster_id.clone(), counter.clone());

        Ok(Arc::new(MockRunner {
            cluster_id: config.cluster_id.clone(),
            behavior,
            counter,
        }))
    }
}

fn cluster(id: &str) -> ClusterConfig {
    ClusterConfig {
        cluster_id: id.to_string(),
        ..Default::default()
    }
}

async fn wait_for_state(manager: &MultiClusterManager, cluster_id: &str, state: ControllerState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.cluster_state(cluster_id) != Some(state) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("cluster {cluster_id} never reached {state}"));
}

fn spawn_run(
    manager: &Arc<MultiClusterManager>,
    token: &CancellationToken,
) -> tokio::task::JoinHandle<Result<(), Report<ManagerError>>> {
    let manager = manager.clone();
    let token = token.clone();
    tokio::spawn(async move { manager.start_all(token).await })
}

#[test]
fn registry_tracks_adds_and_removes() {
    let manager = MultiClusterManager::new(Arc::new(MockFactory::default()));

    manager.add_cluster(cluster("a")).expect("add a");
    manager.add_cluster(cluster("b")).expect("add b");
    assert_eq!(manager.get_cluster_count(), 2);
    assert_eq!(
        manager.get_clusters().keys().cloned().collect::<Vec<_>>(),
        vec!["a".to_string(), "b".to_string()]
    );

    manager.remove_cluster("a").expect("remove a");
    assert_eq!(manager.get_cluster_count(), 1);
    assert!(!manager.contains("a"));

    let err = manager.remove_cluster("a").expect_err("a is gone");
    assert_eq!(err.current_context().to_string(), "Cluster a not found");
    assert_eq!(manager.get_cluster_count(), 1);
}

#[test]
fn duplicate_registration_is_rejected() {
    let manager = MultiClusterManager::new(Arc::new(MockFactory::default()));
    manager.add_cluster(cluster("a")).expect("add a");

    let err = manager.add_cluster(cluster("a")).expect_err("duplicate");
    assert!(matches!(
        err.current_context(),
        ManagerError::DuplicateCluster { .. }
    ));
    assert_eq!(manager.get_cluster_count(), 1);
}

#[test(tokio::test)]
async fn cancellation_waits_for_every_controller() {
    let factory = Arc::new(MockFactory::default());
    let manager = Arc::new(MultiClusterManager::new(factory.clone()));
    for id in ["a", "b", "c"] {
        manager.add_cluster(cluster(id)).expect("add cluster");
    }

    let token = CancellationToken::new();
    let run = spawn_run(&manager, &token);
    for id in ["a", "b", "c"] {
        wait_for_state(&manager, id, ControllerState::Running).await;
    }

    token.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("start_all returns promptly after cancellation")
        .expect("join");
    let err = result.expect_err("cancelled run");
    assert!(matches!(err.current_context(), ManagerError::Cancelled));

    for id in ["a", "b", "c"] {
        let counter = factory.counter(id);
        assert_eq!(counter.started.load(Ordering::SeqCst), 1);
        assert_eq!(counter.stopped.load(Ordering::SeqCst), 1, "{id} exited");
        assert_eq!(manager.cluster_state(id), Some(ControllerState::Stopped));
    }
}

#[test(tokio::test)]
async fn first_failure_is_reported_while_others_keep_running() {
    let factory = Arc::new(
        MockFactory::default().with_behavior("broken", Behavior::FailAfter(Duration::from_millis(50))),
    );
    let manager = Arc::new(MultiClusterManager::new(factory.clone()));
    manager.add_cluster(cluster("healthy")).expect("add healthy");
    manager.add_cluster(cluster("broken")).expect("add broken");

    let token = CancellationToken::new();
    let result = tokio::time::timeout(Duration::from_secs(5), manager.start_all(token.clone()))
        .await
        .expect("failure surfaces");
    let err = result.expect_err("broken cluster fails");
    assert!(matches!(
        err.current_context(),
        ManagerError::Controller { cluster_id } if cluster_id == "broken"
    ));

    assert_eq!(manager.cluster_state("broken"), Some(ControllerState::Stopped));
    assert_eq!(manager.cluster_state("healthy"), Some(ControllerState::Running));
    assert_eq!(factory.counter("healthy").stopped.load(Ordering::SeqCst), 0);

    token.cancel();
    wait_for_state(&manager, "healthy", ControllerState::Stopped).await;
}

#[test(tokio::test)]
async fn removing_a_cluster_stops_its_controller() {
    let factory = Arc::new(MockFactory::default());
    let manager = Arc::new(MultiClusterManager::new(factory.clone()));
    manager.add_cluster(cluster("a")).expect("add a");
    manager.add_cluster(cluster("b")).expect("add b");

    let token = CancellationToken::new();
    let run = spawn_run(&manager, &token);
    wait_for_state(&manager, "a", ControllerState::Running).await;
    wait_for_state(&manager, "b", ControllerState::Running).await;

    manager.remove_cluster("a").expect("remove a");
    let counter = factory.counter("a");
    tokio::time::timeout(Duration::from_secs(5), async {
        while counter.stopped.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("removed controller exits");
    assert_eq!(manager.cluster_state("b"), Some(ControllerState::Running));
    assert!(!run.is_finished(), "removal is not a failure");

    token.cancel();
    let err = run.await.expect("join").expect_err("cancelled");
    assert!(matches!(err.current_context(), ManagerError::Cancelled));
}

#[test(tokio::test)]
async fn clusters_added_during_a_run_are_started() {
    let factory = Arc::new(MockFactory::default());
    let manager = Arc::new(MultiClusterManager::new(factory.clone()));
    manager.add_cluster(cluster("a")).expect("add a");

    let token = CancellationToken::new();
    let run = spawn_run(&manager, &token);
    wait_for_state(&manager, "a", ControllerState::Running).await;

    manager.add_cluster(cluster("late")).expect("add late");
    wait_for_state(&manager, "late", ControllerState::Running).await;
    assert_eq!(factory.counter("late").started.load(Ordering::SeqCst), 1);

    token.cancel();
    let err = run.await.expect("join").expect_err("cancelled");
    assert!(matches!(err.current_context(), ManagerError::Cancelled));
    assert_eq!(factory.counter("late").stopped.load(Ordering::SeqCst), 1);
}

#[test(tokio::test)]
async fn second_run_is_refused_while_running() {
    let manager = Arc::new(MultiClusterManager::new(Arc::new(MockFactory::default())));
    manager.add_cluster(cluster("a")).expect("add a");

    let token = CancellationToken::new();
    let run = spawn_run(&manager, &token);
    wait_for_state(&manager, "a", ControllerState::Running).await;

    let err = manager
        .start_all(CancellationToken::new())
        .await
        .expect_err("already running");
    assert!(matches!(err.current_context(), ManagerError::AlreadyRunning));

    token.cancel();
    let err = run.await.expect("join").expect_err("cancelled");
    assert!(matches!(err.current_context(), ManagerError::Cancelled));
}

#[test(tokio::test)]
async fn clusters_added_after_an_empty_start_are_started() {
    let factory = Arc::new(MockFactory::default());
    let manager = Arc::new(MultiClusterManager::new(factory.clone()));

    let token = CancellationToken::new();
    manager
        .start_all(token.clone())
        .await
        .expect("empty registry starts cleanly");

    manager.add_cluster(cluster("late")).expect("add late");
    wait_for_state(&manager, "late", ControllerState::Running).await;
    assert_eq!(factory.counter("late").started.load(Ordering::SeqCst), 1);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), manager.wait_stopped())
        .await
        .expect("late controller joined");
    assert_eq!(factory.counter("late").stopped.load(Ordering::SeqCst), 1);
    assert_eq!(manager.cluster_state("late"), Some(ControllerState::Stopped));
}

#[test(tokio::test)]
async fn run_survives_a_failure_until_shutdown() {
    let factory = Arc::new(
        MockFactory::default().with_behavior("broken", Behavior::FailAfter(Duration::from_millis(20))),
    );
    let manager = Arc::new(MultiClusterManager::new(factory.clone()));
    manager.add_cluster(cluster("healthy")).expect("add healthy");
    manager.add_cluster(cluster("broken")).expect("add broken");

    let token = CancellationToken::new();
    let err = manager
        .start_all(token.clone())
        .await
        .expect_err("broken cluster fails");
    assert!(matches!(err.current_context(), ManagerError::Controller { .. }));

    manager.add_cluster(cluster("late")).expect("add late");
    wait_for_state(&manager, "late", ControllerState::Running).await;

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), manager.wait_stopped())
        .await
        .expect("survivors joined");
    for id in ["healthy", "late"] {
        assert_eq!(factory.counter(id).stopped.load(Ordering::SeqCst), 1, "{id} exited");
        assert_eq!(manager.cluster_state(id), Some(ControllerState::Stopped));
    }
}
