//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Env var pointing at the log file; when unset logs only go to stderr.
pub const LOG_PATH_ENV_VAR: &str = "LOG_PATH";

/// Number of rotated log files kept on disk.
const MAX_LOG_FILES: usize = 3;

pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// stderr formatting layer shared by all binaries
pub fn get_fmt_layer<S>() -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .boxed()
}

/// Daily rotated file layer, `None` when no path is given or the appender
/// cannot be created. The returned guard must be kept alive for the
/// non-blocking writer to flush.
pub fn get_file_layer<S, P>(log_path: Option<P>) -> Option<(BoxedLayer<S>, WorkerGuard)>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    P: AsRef<Path>,
{
    let log_path = log_path?;
    let log_path = log_path.as_ref();

    let dir = match log_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let prefix = log_path.file_name()?.to_str()?;

    let appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("failed to create rolling file appender at {log_path:?}: {e}");
            return None;
        }
    };

    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .boxed();

    Some((file_layer, guard))
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::Registry;

    use super::*;

    #[test]
    fn file_layer_is_skipped_without_path() {
        let layer = get_file_layer::<Registry, &Path>(None);
        assert!(layer.is_none());
    }

    #[test]
    fn file_layer_created_in_directory() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("controller.log");

        let layer = get_file_layer::<Registry, _>(Some(&path));
        assert!(layer.is_some(), "appender should be created in temp dir");
    }
}
