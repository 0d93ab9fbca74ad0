use std::sync::Arc;

use anyhow::Context;

use reelgen_api::app::services::{AppServices, DevOptions};
use reelgen_infra::SchedulerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    reelgen_observability::init();

    let config = SchedulerConfig::from_env().context("invalid scheduler configuration")?;

    let admin_token = std::env::var("REELGEN_ADMIN_TOKEN").unwrap_or_else(|_| {
        tracing::warn!("REELGEN_ADMIN_TOKEN not set; using insecure dev default");
        "dev-admin-token".to_string()
    });
    let bind = std::env::var("REELGEN_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let database_url = std::env::var("DATABASE_URL").ok();

    let services = Arc::new(
        AppServices::build(config, database_url.as_deref(), DevOptions::from_env())
            .await
            .context("failed to wire services")?,
    );
    let handle = services
        .generation
        .start()
        .await
        .context("failed to start generation service")?;

    let app = reelgen_api::app::build_app(services, admin_token);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    handle.shutdown().await;
    Ok(())
}
