use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::commands::CleanupOrphansArgs;
use crate::config::commands::InspectArgs;
use crate::config::commands::LoadArgs;
use crate::config::commands::LogsArgs;
use crate::config::commands::StatusArgs;
use crate::config::commands::SwitchArgs;
use crate::config::commands::UnloadArgs;
use crate::config::daemon::DaemonArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the lifecycle controller until SIGINT or SIGTERM
    Daemon(Box<DaemonArgs>),
    /// Start a model on a GPU set
    Load(Box<LoadArgs>),
    /// Stop the instance on a GPU set
    Unload(Box<UnloadArgs>),
    /// Replace the model running on a GPU set
    Switch(Box<SwitchArgs>),
    /// Show running instances
    Status(Box<StatusArgs>),
    /// Terminate inference servers no registry entry accounts for
    #[command(name = "cleanup-orphans")]
    CleanupOrphans(Box<CleanupOrphansArgs>),
    /// Print the persisted registry
    Registry(Box<InspectArgs>),
    /// List catalog models and where they are loaded
    Models(Box<InspectArgs>),
    /// Show the tail of a server's output
    Logs(Box<LogsArgs>),
    /// Show per-device occupancy
    Gpus(Box<InspectArgs>),
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn load_takes_model_and_gpus() {
        let cli = Cli::parse_from(["controller", "load", "qwen", "--gpus", "0,1"]);
        match cli.command {
            Commands::Load(args) => {
                assert_eq!(args.model, "qwen");
                assert_eq!(args.gpus, "0,1");
            }
            _ => panic!("expected load command"),
        }
    }

    #[test]
    fn logs_defaults_to_a_hundred_lines() {
        let cli = Cli::parse_from(["controller", "logs", "--gpus", "2"]);
        match cli.command {
            Commands::Logs(args) => {
                assert_eq!(args.gpus, "2");
                assert_eq!(args.lines, 100);
            }
            _ => panic!("expected logs command"),
        }
    }
}
