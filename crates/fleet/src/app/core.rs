use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;

/// Application core structure with explicit dependencies
pub struct Application {
    services: ApplicationServices,
    daemon_args: DaemonArgs,
}

impl Application {
    /// Create new application with explicit service dependencies
    pub fn new(services: ApplicationServices, daemon_args: DaemonArgs) -> Self {
        Self {
            services,
            daemon_args,
        }
    }

    /// Get access to services
    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    /// Get daemon arguments
    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Run application, start all tasks and wait for completion
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting all application tasks...");

        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(self);

        if let Err(e) = tasks
            .wait_for_completion(self.daemon_args.shutdown_timeout())
            .await
        {
            tracing::error!("Error during task execution: {e}");
            self.shutdown();
            return Err(e);
        }

        self.shutdown();
        tracing::info!("Application run completed");
        Ok(())
    }

    /// Record shutdown of every cluster controller
    pub fn shutdown(&self) {
        tracing::info!("Shutting down application...");
        self.services.manager.stop_all();
        tracing::info!("Application shutdown completed");
    }
}
