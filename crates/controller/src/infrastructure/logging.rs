//! provides logging helpers

use std::env;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{self};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use utils::logging::LOG_PATH_ENV_VAR;

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// Logs go to stderr, and additionally to a daily rotated file when
/// `LOG_PATH` is set. The returned guard must live until exit.
pub fn init() -> Option<WorkerGuard> {
    let log_path = env::var(LOG_PATH_ENV_VAR).ok();

    let fmt_layer = utils::logging::get_fmt_layer().with_filter(env_filter());

    match utils::logging::get_file_layer(log_path) {
        Some((file_layer, guard)) => {
            registry()
                .with(fmt_layer)
                .with(file_layer.with_filter(env_filter()))
                .init();
            Some(guard)
        }
        None => {
            registry().with(fmt_layer).init();
            None
        }
    }
}
