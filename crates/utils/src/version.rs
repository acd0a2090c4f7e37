use std::sync::LazyLock;

/// Defines the application version.
///
/// `IMAGE_VERSION` comes from the `VERSION` env var at build time, the commit
/// information from git when the build runs inside a checkout.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        option_env!("VERGEN_GIT_SHA").unwrap_or("unknown"),
        if option_env!("VERGEN_GIT_DIRTY") == Some("true") {
            "-dirty"
        } else {
            ""
        }
    )
});
