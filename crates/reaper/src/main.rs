use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use convoy_coordination::{PostgresCoordinationStore, Reaper};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded .env from {:?}", path);
    }

    // RUST_LOG wins over LOG_LEVEL
    let log_filter = env::var("RUST_LOG").ok().unwrap_or_else(|| {
        let level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        format!("convoy_reaper={level},convoy_coordination={level}")
    });
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("convoy-reaper starting...");

    let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    let interval = env::var("REAPER_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_INTERVAL_SECS));
    let run_migrations = env::var("REAPER_RUN_MIGRATIONS")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Connected to database");

    let store = PostgresCoordinationStore::new(pool);
    if run_migrations {
        store
            .migrate()
            .await
            .context("Failed to run coordination migrations")?;
        tracing::info!("Migrations applied");
    }

    let reaper = Reaper::new(Arc::new(store), interval);
    tracing::info!(interval_secs = interval.as_secs(), "Starting reaper");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = reaper.run(shutdown_rx);
    tokio::pin!(run);

    tokio::select! {
        _ = &mut run => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            run.await;
        }
    }

    tracing::info!("Reaper shutdown complete");
    Ok(())
}
