use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;

use crate::app::ApplicationServices;
use crate::config::load_model_catalog;
use crate::config::ControllerArgs;
use crate::domain::traits::GpuTelemetry;
use crate::domain::traits::HealthProbe;
use crate::domain::traits::ProcessLauncher;
use crate::domain::traits::ProcessTable;
use crate::domain::Allocator;
use crate::domain::LifecycleOrchestrator;
use crate::domain::ProcessRegistry;
use crate::domain::ProcessSupervisor;
use crate::domain::SupervisorSettings;
use crate::infrastructure::gpu_init::initialize_gpu_system;
use crate::infrastructure::health_probe::HttpHealthProbe;
use crate::infrastructure::launcher::TokioProcessLauncher;
use crate::infrastructure::process_table::ProcfsProcessTable;

/// Application builder
pub struct ApplicationBuilder {
    controller: ControllerArgs,
}

impl ApplicationBuilder {
    /// Create new application builder
    pub fn new(controller: ControllerArgs) -> Self {
        Self { controller }
    }

    /// Build the services and adopt whatever the registry still tracks
    pub async fn build(self) -> Result<ApplicationServices> {
        tracing::info!("Building application components...");
        let args = &self.controller;

        let catalog = Arc::new(load_model_catalog(&args.models_config).await?);

        let gpu_system = initialize_gpu_system(args.device_count, args.disable_telemetry)?;
        let allocator = Allocator::new(gpu_system.device_count, args.port_policy());
        let telemetry = gpu_system
            .telemetry
            .map(|telemetry| telemetry as Arc<dyn GpuTelemetry>);

        let table: Arc<dyn ProcessTable> = Arc::new(ProcfsProcessTable::new());
        let launcher: Arc<dyn ProcessLauncher> = Arc::new(TokioProcessLauncher::new());
        let probe: Arc<dyn HealthProbe> = Arc::new(
            HttpHealthProbe::new(args.health_request_timeout())
                .map_err(|report| anyhow::anyhow!("{report:?}"))
                .context("Failed to create health probe")?,
        );

        let settings = SupervisorSettings::from(args);
        let supervisor = ProcessSupervisor::new(settings, launcher, table.clone(), probe);
        let registry = Arc::new(ProcessRegistry::new(
            args.registry_file.clone(),
            args.executable.clone(),
            table,
        ));

        let orchestrator = Arc::new(LifecycleOrchestrator::new(
            allocator,
            catalog,
            supervisor,
            registry.clone(),
            telemetry,
            args.occupancy_policy(),
        ));

        let recovered = orchestrator.recover().await;
        tracing::info!(
            recovered,
            registry = %registry.path().display(),
            device_count = gpu_system.device_count,
            "Application components ready"
        );

        Ok(ApplicationServices {
            orchestrator,
            registry,
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        controller: ControllerArgs,
    }

    #[test(tokio::test)]
    async fn builds_services_without_gpus() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let models = dir.path().join("models.yaml");
        std::fs::write(&models, "- {id: m1, name: Model One, path: /models/m1.gguf}\n")
            .expect("should write catalog");
        let registry = dir.path().join("data").join("processes.json");

        let args = Harness::parse_from([
            "controller".to_string(),
            "--models-config".to_string(),
            models.display().to_string(),
            "--registry-file".to_string(),
            registry.display().to_string(),
            "--device-count".to_string(),
            "2".to_string(),
            "--disable-telemetry".to_string(),
        ])
        .controller;

        let services = ApplicationBuilder::new(args)
            .build()
            .await
            .expect("should build services");

        assert_eq!(services.registry.path(), registry.as_path());
        assert_eq!(services.orchestrator.allocator().device_count(), 2);
        let models = services.orchestrator.models().await;
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].loaded_on, None);
        services.orchestrator.shutdown().await;
    }

    #[test(tokio::test)]
    async fn missing_catalog_fails_the_build() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let args = Harness::parse_from([
            "controller".to_string(),
            "--models-config".to_string(),
            dir.path().join("absent.yaml").display().to_string(),
            "--device-count".to_string(),
            "1".to_string(),
            "--disable-telemetry".to_string(),
        ])
        .controller;

        assert!(ApplicationBuilder::new(args).build().await.is_err());
    }
}
