use std::sync::Arc;

use anyhow::Context;
use stockledger_infra::LedgerConfig;
use stockledger_observability::LogConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockledger_observability::init(&LogConfig::from_env());

    let config = LedgerConfig::from_env().context("invalid configuration")?;
    let services = stockledger_api::app::services::build_services(&config)
        .await
        .with_context(|| format!("failed to open {} backend", config.database.backend_name()))?;

    let app = stockledger_api::app::build_app(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        backend = config.database.backend_name(),
        database = %config.database.masked_url(),
        "listening"
    );

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
