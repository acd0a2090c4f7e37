use anyhow::Result;

use crate::app::tasks::Tasks;
use crate::app::ApplicationServices;
use crate::config::DaemonArgs;

/// Main application structure
pub struct Application {
    services: ApplicationServices,
    daemon_args: DaemonArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, daemon_args: DaemonArgs) -> Self {
        Self {
            services,
            daemon_args,
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Run the application until a shutdown signal arrives
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting lifecycle controller daemon");

        if self.daemon_args.cleanup_orphans_on_start {
            self.cleanup_orphans().await;
        }
        self.preload().await;

        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(self)?;
        tasks.wait_for_completion().await?;

        Ok(())
    }

    /// Stop background work and flush the registry
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down lifecycle controller daemon");

        let orchestrator = &self.services.orchestrator;
        if self.daemon_args.stop_instances_on_exit {
            tracing::info!("Stopping all instances before exit");
            orchestrator.shutdown_instances().await;
        }
        orchestrator.shutdown().await;

        tracing::info!("Lifecycle controller shutdown complete");
        Ok(())
    }

    async fn cleanup_orphans(&self) {
        match self.services.orchestrator.cleanup_orphans(false).await {
            Ok(report) => tracing::info!(
                found = report.found,
                killed = report.killed,
                failed = report.failures.len(),
                "Orphan cleanup finished"
            ),
            Err(err) => tracing::error!(error = %err, "Orphan cleanup failed"),
        }
    }

    /// A failed preload is logged and does not keep the daemon from starting.
    async fn preload(&self) {
        for preload in &self.daemon_args.preload {
            match self
                .services
                .orchestrator
                .load(&preload.model_id, &preload.gpus)
                .await
            {
                Ok(status) => tracing::info!(
                    gpu_set = %status.gpu_set,
                    model_id = %status.model_id,
                    port = status.port,
                    "Preloaded model"
                ),
                Err(err) => tracing::error!(
                    gpus = %preload.gpus,
                    model_id = %preload.model_id,
                    error = %err,
                    "Failed to preload model"
                ),
            }
        }
    }
}
