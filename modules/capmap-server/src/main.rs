use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use capmap_core::{AppConfig, CacheLayer, PostcodeIndex, ServerDeps};
use capmap_server::routes;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting capmap-server");

    let config = Arc::new(AppConfig::from_env()?);

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(std::time::Duration::from_secs(
            config.request_deadline_secs,
        ))
        .connect(&config.database_url)
        .await?;
    tracing::info!("Connected to database");

    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Migrations complete");

    let cache = CacheLayer::connect(config.redis_url.as_deref(), config.emergency_mode).await;

    let postcodes = Arc::new(PostcodeIndex::load(&config.postcode_static_dir));

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(
            config.request_deadline_secs,
        ))
        .build()?;

    let deps = Arc::new(ServerDeps::new(
        pool,
        http_client,
        cache,
        postcodes,
        config.clone(),
    ));

    let app = routes::build_router(deps);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Listening");
    axum::serve(listener, app).await?;

    Ok(())
}
