use std::path::PathBuf;

use anyhow::Context;
use audiobook_pipeline::config::PipelineConfig;
use audiobook_pipeline::services::ServiceContainer;
use audiobook_pipeline::{database, logging};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = PipelineConfig::from_env().context("invalid configuration")?;

    let _log_guard = logging::init_logging(config.log_dir.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        api = config.roles.api,
        stages = ?config.roles.stages,
        trigger_mode = %config.trigger_mode,
        status_reporting = %config.status_reporting,
        "Starting audiobook-pipeline"
    );

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let container = ServiceContainer::new(pool, config)?;

    if let Some(dir) = container.config.log_dir.as_deref() {
        logging::start_retention_cleanup(PathBuf::from(dir), container.cancellation_token());
    }

    if let Err(e) = container.start().await {
        error!(error = %e, "Failed to start services");
        container.shutdown().await?;
        return Err(e.into());
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    container.shutdown().await?;
    Ok(())
}
