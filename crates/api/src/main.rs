//! Subsync API server

use anyhow::Context;
use subsync_api::{create_router, AppState, Config};
use subsync_billing::{plans::default_catalog, BillingService};
use subsync_shared::{create_pool, init_tracing, run_migrations, shutdown_signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;

    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let billing = BillingService::from_env(pool.clone()).context("Failed to initialize billing")?;
    billing
        .catalog
        .seed(default_catalog())
        .await
        .context("Failed to seed plan catalog")?;

    let bind_address = config.bind_address.clone();
    let public_url = config.public_url.clone();
    let state = AppState::new(config, pool, billing);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!(address = %bind_address, public_url = %public_url, "Subsync API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutdown complete");
    Ok(())
}
