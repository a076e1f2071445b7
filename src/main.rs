use anyhow::Result;
use procdeck::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    procdeck::setup_logging(&config.log_level)?;

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting procdeck");
    tracing::debug!("Loaded configuration: {:?}", config);

    procdeck::run(config).await
}
