use anyhow::Result;
use clap::Parser;
use controller::cmd;
use controller::config::Cli;
use controller::config::Commands;
use controller::logging;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = logging::init();

    match cli.command {
        Commands::Daemon(args) => cmd::run_daemon(*args).await,
        Commands::Load(args) => cmd::run_load(*args).await,
        Commands::Unload(args) => cmd::run_unload(*args).await,
        Commands::Switch(args) => cmd::run_switch(*args).await,
        Commands::Status(args) => cmd::run_status(*args).await,
        Commands::CleanupOrphans(args) => cmd::run_cleanup_orphans(*args).await,
        Commands::Registry(args) => cmd::run_registry(*args).await,
        Commands::Models(args) => cmd::run_models(*args).await,
        Commands::Logs(args) => cmd::run_logs(*args).await,
        Commands::Gpus(args) => cmd::run_gpus(*args).await,
    }
}
