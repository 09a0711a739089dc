//! Batch builder command. Rebuilds or extends the location_groups table
//! from the raw component catalogue, applies the taxonomy passes, bumps
//! the cache data version on a full rebuild, and pre-warms summaries.
//!
//! Exit codes: 0 success, 1 usage error, 2 runtime failure after partial
//! progress, 3 database unavailable.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use capmap_core::{AppConfig, CacheLayer, PostcodeIndex, ServerDeps};
use capmap_domains::builder::{self, BuildMode};
use capmap_domains::summaries;

#[derive(Parser)]
#[command(
    name = "build-location-groups",
    about = "Build denormalized location groups from the component table"
)]
struct Cli {
    /// Truncate and rebuild every location (default is incremental)
    #[arg(long)]
    rebuild: bool,

    /// Stop after this many locations
    #[arg(long)]
    limit: Option<i64>,

    /// Skip the cache pre-warm pass
    #[arg(long)]
    no_warm: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Some(limit) = cli.limit {
        if limit <= 0 {
            eprintln!("--limit must be positive");
            return ExitCode::from(1);
        }
    }

    let config = match AppConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    let pool = match sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(&config.database_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "Database unavailable");
            return ExitCode::from(3);
        }
    };

    let mode = if cli.rebuild {
        BuildMode::Full
    } else {
        BuildMode::Incremental
    };

    let stats =
        match builder::build_location_groups(mode, cli.limit, config.active_year_cutoff, &pool)
            .await
        {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(error = %e, "Build failed with partial progress committed");
                return ExitCode::from(2);
            }
        };

    if let Err(e) = builder::apply_taxonomy_augmentations(&pool).await {
        tracing::error!(error = %e, "Taxonomy passes failed");
        return ExitCode::from(2);
    }

    let mut cache = CacheLayer::connect(config.redis_url.as_deref(), config.emergency_mode).await;
    if mode == BuildMode::Full {
        cache.bump_data_version().await;
    }

    if !cli.no_warm {
        let postcodes = Arc::new(PostcodeIndex::load(&config.postcode_static_dir));
        let http_client = match reqwest::Client::builder().build() {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(error = %e, "HTTP client init failed");
                return ExitCode::from(2);
            }
        };
        let deps = ServerDeps::new(pool, http_client, cache, postcodes, config);
        if let Err(e) = summaries::warm_summaries(&deps).await {
            tracing::warn!(error = %e, "Summary pre-warm failed, continuing");
        }
    }

    tracing::info!(
        written = stats.written,
        skipped = stats.skipped,
        failed = stats.failed,
        total = stats.total,
        "Done"
    );
    ExitCode::SUCCESS
}
