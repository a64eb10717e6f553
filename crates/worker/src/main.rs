use anyhow::Context;

use packline_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    packline_observability::init(config.log_format);

    let services = packline_worker::app::build_services(&config).await?;
    let scheduler = services.start_scheduler(&config.scheduler);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    services.shutdown(scheduler).await;
    Ok(())
}
