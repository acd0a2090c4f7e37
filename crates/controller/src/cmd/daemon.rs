use anyhow::Result;
use utils::version;

use crate::app::Application;
use crate::app::ApplicationBuilder;
use crate::config::DaemonArgs;

pub async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    tracing::info!("Starting lifecycle controller daemon {}", &**version::VERSION);

    let services = ApplicationBuilder::new(daemon_args.controller.clone())
        .build()
        .await?;
    let app = Application::new(services, daemon_args);

    app.run().await?;
    app.shutdown().await?;

    Ok(())
}
