use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ApiServer;
use crate::api::ApiState;
use crate::app::core::Application;
use crate::manager::ManagerError;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) {
        let cli = app.daemon_args();

        let manager_task = self.spawn_manager_task(app);
        self.tasks.push(manager_task);

        if let Some(limiter_task) = self.spawn_rate_limiter_cleanup_task(app) {
            self.tasks.push(limiter_task);
        }

        if cli.enable_api {
            let api_server_task = self.spawn_api_server_task(app);
            self.tasks.push(api_server_task);
        }
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self, shutdown_timeout: Duration) -> Result<()> {
        // Set up signal handling for graceful shutdown
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::signal;
                use tokio::signal::unix::SignalKind;
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                        return;
                    }
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        if self.tasks.is_empty() {
            tracing::warn!("No tasks to supervise");
            return Ok(());
        }

        let finished = tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                None
            }
            _ = self.cancellation_token.cancelled() => {
                tracing::info!("Shutdown requested, cancelling all tasks");
                None
            }
            // Wait for any task to complete unexpectedly
            (result, index, _) = futures::future::select_all(&mut self.tasks) => Some((result, index)),
        };

        self.cancellation_token.cancel();
        let Some((result, index)) = finished else {
            self.wait_for_tasks_with_timeout(shutdown_timeout).await;
            return Ok(());
        };

        let _ = self.tasks.remove(index);
        self.wait_for_tasks_with_timeout(shutdown_timeout).await;
        if let Err(e) = result {
            tracing::error!("Task completed with error: {e}");
            return Err(e.into());
        }
        tracing::warn!("Task completed unexpectedly");
        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    /// Run every cluster controller until shutdown.
    ///
    /// A failing cluster is logged and does not stop the daemon. The task
    /// stays alive until the root token is cancelled and every controller,
    /// including clusters added at runtime, has exited.
    fn spawn_manager_task(&self, app: &Application) -> JoinHandle<()> {
        let manager = app.services().manager.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting multi-cluster manager");
            match manager.start_all(token.clone()).await {
                Ok(()) => tracing::info!("Multi-cluster manager finished"),
                Err(report) if matches!(report.current_context(), ManagerError::Cancelled) => {
                    tracing::info!("Multi-cluster manager stopped");
                }
                Err(report) => {
                    tracing::error!("Failed to start multi-cluster manager: {report:?}");
                }
            }
            manager.wait_stopped().await;
            tracing::info!("Multi-cluster manager task completed");
        })
    }

    fn spawn_rate_limiter_cleanup_task(&self, app: &Application) -> Option<JoinHandle<()>> {
        let limiter = app.services().rate_limiter.clone()?;
        let token = self.cancellation_token.clone();

        Some(tokio::spawn(async move {
            tracing::info!("Starting rate limiter cleanup task");
            limiter.run_cleanup(token).await;
            tracing::info!("Rate limiter cleanup task completed");
        }))
    }

    fn spawn_api_server_task(&self, app: &Application) -> JoinHandle<()> {
        let cli = app.daemon_args();
        let state = ApiState::new(app.services().manager.clone(), cli.default_cluster());
        let limiter = app.services().rate_limiter.clone();
        let listen_addr = cli.api_listen_addr.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let api_server = ApiServer::new(state, limiter, listen_addr);
            if let Err(e) = api_server.run(token).await {
                tracing::error!("API server error: {e:?}");
            }
            tracing::info!("API server task completed");
        })
    }
}
