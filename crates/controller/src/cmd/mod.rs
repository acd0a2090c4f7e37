//! Command layer - Entry points for the controller subcommands

pub mod daemon;
pub mod oneshot;

pub use daemon::run_daemon;
pub use oneshot::run_cleanup_orphans;
pub use oneshot::run_gpus;
pub use oneshot::run_load;
pub use oneshot::run_logs;
pub use oneshot::run_models;
pub use oneshot::run_registry;
pub use oneshot::run_status;
pub use oneshot::run_switch;
pub use oneshot::run_unload;
