use std::path::PathBuf;

use anyhow::Result;

/// Application configuration loaded from environment variables. Secrets and
/// env-specific values only; taxonomy and query policy are compiled in.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Database
    pub database_url: String,

    // Shared cache (absent → local-only caching)
    pub redis_url: Option<String>,

    // Operational kill switch: disables all cache reads and writes
    pub emergency_mode: bool,

    // Auction years at or past this count a location as active
    pub active_year_cutoff: i32,

    // Per-request deadline applied to the whole HTTP pipeline
    pub request_deadline_secs: u64,

    // External postcode provider
    pub postcode_api_base_url: String,

    // Directory holding the prebuilt postcode index files
    pub postcode_static_dir: PathBuf,

    // Only used by the write-side business augmentation pass
    pub places_api_key: Option<String>,

    // Listener
    pub host: String,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")?,
            redis_url: std::env::var("REDIS_URL").ok(),
            emergency_mode: std::env::var("EMERGENCY_MODE")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
            active_year_cutoff: std::env::var("ACTIVE_YEAR_CUTOFF")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2024),
            request_deadline_secs: std::env::var("REQUEST_DEADLINE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            postcode_api_base_url: std::env::var("POSTCODE_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.postcodes.io".to_string()),
            postcode_static_dir: std::env::var("POSTCODE_STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./static/cache")),
            places_api_key: std::env::var("PLACES_API_KEY").ok(),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
        };

        config.log_keys();
        Ok(config)
    }

    fn log_keys(&self) {
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => {
                    let n = v.len().min(5);
                    format!("{}...({} chars)", &v[..n], v.len())
                }
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  REDIS_URL: {}", preview_opt(&self.redis_url));
        tracing::info!("  EMERGENCY_MODE: {}", self.emergency_mode);
        tracing::info!("  ACTIVE_YEAR_CUTOFF: {}", self.active_year_cutoff);
        tracing::info!("  PLACES_API_KEY: {}", preview_opt(&self.places_api_key));
        tracing::info!(
            "  POSTCODE_STATIC_DIR: {}",
            self.postcode_static_dir.display()
        );
    }
}
