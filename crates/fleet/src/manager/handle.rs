use std::sync::Arc;
use std::sync::Mutex;

use api_types::ClusterConfig;
use tokio_util::sync::CancellationToken;

use crate::controller::ClusterRunner;
use crate::controller::ControllerState;
use crate::informer::DeploymentStore;

/// Registry entry binding a cluster config to its controller.
pub struct ClusterHandle {
    config: Arc<ClusterConfig>,
    runner: Arc<dyn ClusterRunner>,
    state: Mutex<ControllerState>,
    /// Set once the controller has been launched
    token: Mutex<Option<CancellationToken>>,
}

impl ClusterHandle {
    pub(crate) fn new(config: Arc<ClusterConfig>, runner: Arc<dyn ClusterRunner>) -> Self {
        Self {
            config,
            runner,
            state: Mutex::new(ControllerState::Starting),
            token: Mutex::new(None),
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.config.cluster_id
    }

    pub fn config(&self) -> &Arc<ClusterConfig> {
        &self.config
    }

    pub(crate) fn runner(&self) -> Arc<dyn ClusterRunner> {
        self.runner.clone()
    }

    pub fn store(&self) -> Option<DeploymentStore> {
        self.runner.store()
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock().expect("poisoned")
    }

    pub(crate) fn set_state(&self, state: ControllerState) {
        *self.state.lock().expect("poisoned") = state;
    }

    /// Move `from` to `to` if the handle is currently in `from`.
    pub(crate) fn transition(&self, from: ControllerState, to: ControllerState) -> bool {
        let mut state = self.state.lock().expect("poisoned");
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Bind the run token. Returns `false` if the controller was already
    /// launched.
    pub(crate) fn bind(&self, token: CancellationToken) -> bool {
        let mut slot = self.token.lock().expect("poisoned");
        if slot.is_some() {
            return false;
        }
        *slot = Some(token);
        true
    }

    /// Release the run token once the controller task has exited.
    pub(crate) fn unbind(&self) {
        self.token.lock().expect("poisoned").take();
    }

    /// Cancel the running controller, if launched.
    pub(crate) fn cancel(&self) {
        if let Some(token) = self.token.lock().expect("poisoned").as_ref() {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("cluster_id", &self.config.cluster_id)
            .field("state", &self.state())
            .finish()
    }
}
