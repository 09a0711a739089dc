use std::sync::Arc;

use sqlx::PgPool;

use crate::cache::CacheLayer;
use crate::config::AppConfig;
use crate::postcodes::{PostcodeClient, PostcodeIndex};

/// Shared dependency bundle handed to every request handler and service.
/// Everything here is cheap to clone or internally shared.
#[derive(Clone)]
pub struct ServerDeps {
    pool: PgPool,
    pub http_client: reqwest::Client,
    pub cache: CacheLayer,
    pub postcodes: Arc<PostcodeIndex>,
    pub postcode_client: PostcodeClient,
    pub config: Arc<AppConfig>,
}

impl ServerDeps {
    pub fn new(
        pool: PgPool,
        http_client: reqwest::Client,
        cache: CacheLayer,
        postcodes: Arc<PostcodeIndex>,
        config: Arc<AppConfig>,
    ) -> Self {
        let postcode_client = PostcodeClient::new(
            http_client.clone(),
            config.postcode_api_base_url.clone(),
            cache.clone(),
        );
        Self {
            pool,
            http_client,
            cache,
            postcodes,
            postcode_client,
            config,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn active_year_cutoff(&self) -> i32 {
        self.config.active_year_cutoff
    }
}
