//! One-shot commands: recover from the registry, act once, print JSON and
//! exit. Instances are left running for the next invocation to adopt.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use serde::Serialize;

use crate::app::ApplicationBuilder;
use crate::config::CleanupOrphansArgs;
use crate::config::ControllerArgs;
use crate::config::InspectArgs;
use crate::config::LoadArgs;
use crate::config::LogsArgs;
use crate::config::StatusArgs;
use crate::config::SwitchArgs;
use crate::config::UnloadArgs;
use crate::domain::LifecycleOrchestrator;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Unloaded {
    gpu_set: String,
    unloaded: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OrphanList {
    dry_run: bool,
    orphans: Vec<u32>,
}

/// Build the services, run `action`, then stop monitoring and flush the
/// registry whatever the outcome.
async fn with_services<T, F, Fut>(controller: ControllerArgs, action: F) -> Result<()>
where
    T: Serialize,
    F: FnOnce(Arc<LifecycleOrchestrator>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let services = ApplicationBuilder::new(controller).build().await?;
    let orchestrator = services.orchestrator;
    let outcome = action(orchestrator.clone()).await;
    orchestrator.shutdown().await;

    let value = outcome?;
    let rendered = serde_json::to_string_pretty(&value).context("Failed to render result")?;
    println!("{rendered}");
    Ok(())
}

pub async fn run_load(args: LoadArgs) -> Result<()> {
    let LoadArgs {
        controller,
        model,
        gpus,
    } = args;
    with_services(controller, |orchestrator| async move {
        orchestrator
            .load(&model, &gpus)
            .await
            .with_context(|| format!("Failed to load {model} on GPUs {gpus}"))
    })
    .await
}

pub async fn run_unload(args: UnloadArgs) -> Result<()> {
    let UnloadArgs { controller, gpus } = args;
    with_services(controller, |orchestrator| async move {
        orchestrator
            .unload(&gpus)
            .await
            .with_context(|| format!("Failed to unload GPUs {gpus}"))?;
        Ok(Unloaded {
            gpu_set: gpus,
            unloaded: true,
        })
    })
    .await
}

pub async fn run_switch(args: SwitchArgs) -> Result<()> {
    let SwitchArgs {
        controller,
        model,
        gpus,
    } = args;
    with_services(controller, |orchestrator| async move {
        orchestrator
            .switch(&gpus, &model)
            .await
            .with_context(|| format!("Failed to switch GPUs {gpus} to {model}"))
    })
    .await
}

pub async fn run_status(args: StatusArgs) -> Result<()> {
    let StatusArgs { controller, gpus } = args;
    with_services(controller, |orchestrator| async move {
        Ok(orchestrator.status(gpus.as_deref()).await?)
    })
    .await
}

pub async fn run_cleanup_orphans(args: CleanupOrphansArgs) -> Result<()> {
    let CleanupOrphansArgs {
        controller,
        force,
        dry_run,
    } = args;
    if dry_run {
        return with_services(controller, |orchestrator| async move {
            Ok(OrphanList {
                dry_run: true,
                orphans: orchestrator.find_orphans().await?,
            })
        })
        .await;
    }
    with_services(controller, |orchestrator| async move {
        Ok(orchestrator.cleanup_orphans(force).await?)
    })
    .await
}

pub async fn run_registry(args: InspectArgs) -> Result<()> {
    with_services(args.controller, |orchestrator| async move {
        Ok(orchestrator.registry_snapshot().await)
    })
    .await
}

pub async fn run_models(args: InspectArgs) -> Result<()> {
    with_services(args.controller, |orchestrator| async move {
        Ok(orchestrator.models().await)
    })
    .await
}

pub async fn run_logs(args: LogsArgs) -> Result<()> {
    let LogsArgs {
        controller,
        gpus,
        lines,
    } = args;
    with_services(controller, |orchestrator| async move {
        orchestrator
            .logs(&gpus, lines)
            .await
            .with_context(|| format!("Failed to read logs of GPUs {gpus}"))
    })
    .await
}

pub async fn run_gpus(args: InspectArgs) -> Result<()> {
    with_services(args.controller, |orchestrator| async move {
        Ok(orchestrator.gpus().await)
    })
    .await
}
