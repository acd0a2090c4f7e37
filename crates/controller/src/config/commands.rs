use clap::Parser;

use super::controller::ControllerArgs;

#[derive(Parser, Debug, Clone)]
pub struct LoadArgs {
    #[command(flatten)]
    pub controller: ControllerArgs,

    /// Model id from the catalog
    pub model: String,

    #[arg(long, help = "GPU indices, e.g. 0 or 0,1")]
    pub gpus: String,
}

#[derive(Parser, Debug, Clone)]
pub struct UnloadArgs {
    #[command(flatten)]
    pub controller: ControllerArgs,

    #[arg(long, help = "GPU set of the instance to stop")]
    pub gpus: String,
}

#[derive(Parser, Debug, Clone)]
pub struct SwitchArgs {
    #[command(flatten)]
    pub controller: ControllerArgs,

    /// Model id to run instead of the current one
    pub model: String,

    #[arg(long, help = "GPU set to switch")]
    pub gpus: String,
}

#[derive(Parser, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub controller: ControllerArgs,

    #[arg(long, help = "Only report this GPU set")]
    pub gpus: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct CleanupOrphansArgs {
    #[command(flatten)]
    pub controller: ControllerArgs,

    #[arg(long, help = "SIGKILL immediately instead of SIGTERM with a grace period")]
    pub force: bool,

    #[arg(long, help = "Only list orphaned pids")]
    pub dry_run: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct LogsArgs {
    #[command(flatten)]
    pub controller: ControllerArgs,

    #[arg(long, help = "GPU set whose server output to show")]
    pub gpus: String,

    #[arg(
        long,
        default_value = "100",
        help = "Number of trailing lines, capped at 300"
    )]
    pub lines: usize,
}

/// Commands that only read the catalog or registry file
#[derive(Parser, Debug, Clone)]
pub struct InspectArgs {
    #[command(flatten)]
    pub controller: ControllerArgs,
}
