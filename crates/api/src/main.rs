use std::sync::Arc;

use anyhow::Context;

use tether_api::app::{AppServices, build_app};
use tether_infra::TetherConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tether_observability::init();

    let config = TetherConfig::from_env();
    let schema = config.load_schema()?;
    let services = Arc::new(AppServices::build(&config, schema).await?);
    let app = build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    services.shutdown().await;
    Ok(())
}
