//! Apply pending SQL migrations and exit.
//!
//! Exit codes: 0 success, 2 migration failure, 3 database unavailable.

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use capmap_core::AppConfig;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    let pool = match sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.database_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "Database unavailable");
            return ExitCode::from(3);
        }
    };

    match sqlx::migrate!("../../migrations").run(&pool).await {
        Ok(()) => {
            tracing::info!("Migrations complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Migration failed");
            ExitCode::from(2)
        }
    }
}
