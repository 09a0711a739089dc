//! Two-tier cache: a small bounded in-process tier in front of a shared
//! Redis tier. Values are JSON strings. Cache failures are never surfaced
//! to callers; every error degrades to a miss.

use std::sync::Arc;
use std::time::Duration;

use md5::{Digest, Md5};
use moka::future::Cache as LocalCache;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// TTL policy. Negative results are capped at one hour so upstream
/// recoveries are picked up quickly.
pub mod ttl {
    use std::time::Duration;

    pub const MAP: Duration = Duration::from_secs(60 * 60);
    pub const SEARCH: Duration = Duration::from_secs(60 * 60);
    pub const SUMMARY: Duration = Duration::from_secs(24 * 60 * 60);
    pub const POSTCODE: Duration = Duration::from_secs(24 * 60 * 60);
    pub const POSTCODE_NEAREST: Duration = Duration::from_secs(6 * 60 * 60);
    pub const NEGATIVE: Duration = Duration::from_secs(60 * 60);
}

const DATA_VERSION_KEY: &str = "capmap:data_version";
const LOCAL_CAPACITY: u64 = 2_000;
const LOCAL_TTL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct CacheLayer {
    // false in emergency mode: every get misses, every set is a no-op
    enabled: bool,
    local: LocalCache<String, Arc<str>>,
    shared: Option<ConnectionManager>,
    version: u64,
}

impl CacheLayer {
    /// Connect both tiers. A missing or unreachable Redis degrades to
    /// local-only with a warning; emergency mode disables everything.
    pub async fn connect(redis_url: Option<&str>, emergency: bool) -> Self {
        let local = LocalCache::builder()
            .max_capacity(LOCAL_CAPACITY)
            .time_to_live(LOCAL_TTL)
            .build();

        if emergency {
            tracing::warn!("EMERGENCY_MODE set: cache layer is a pass-through");
            return Self {
                enabled: false,
                local,
                shared: None,
                version: 0,
            };
        }

        let shared = match redis_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match ConnectionManager::new(client).await {
                    Ok(conn) => Some(conn),
                    Err(e) => {
                        tracing::warn!(error = %e, "Redis unreachable, caching is local-only");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid Redis URL, caching is local-only");
                    None
                }
            },
            None => {
                tracing::info!("No REDIS_URL configured, caching is local-only");
                None
            }
        };

        let version = match shared.clone() {
            Some(mut conn) => conn
                .get::<_, Option<u64>>(DATA_VERSION_KEY)
                .await
                .ok()
                .flatten()
                .unwrap_or(1),
            None => 1,
        };

        tracing::info!(version, shared = shared.is_some(), "Cache layer ready");

        Self {
            enabled: true,
            local,
            shared,
            version,
        }
    }

    /// A layer that never caches. Emergency mode and tests.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            local: LocalCache::builder().max_capacity(0).build(),
            shared: None,
            version: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.enabled {
            return None;
        }

        if let Some(raw) = self.local.get(key).await {
            return match serde_json::from_str(&raw) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(key, error = %e, "Corrupt local cache entry, dropping");
                    self.local.invalidate(key).await;
                    None
                }
            };
        }

        let mut conn = self.shared.clone()?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(v) => {
                    self.local.insert(key.to_string(), Arc::from(raw)).await;
                    Some(v)
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "Corrupt shared cache entry, ignoring");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Shared cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if !self.enabled {
            return;
        }

        let raw = match serde_json::to_string(value) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to serialize cache value");
                return;
            }
        };

        self.local
            .insert(key.to_string(), Arc::from(raw.as_str()))
            .await;

        if let Some(mut conn) = self.shared.clone() {
            if let Err(e) = conn
                .set_ex::<_, _, ()>(key, raw, ttl.as_secs().max(1))
                .await
            {
                tracing::warn!(key, error = %e, "Shared cache write failed");
            }
        }
    }

    /// Bump the global data version after a full rebuild. Keys embed the
    /// version, so everything cached against the old data becomes
    /// unreachable and expires on its own.
    pub async fn bump_data_version(&mut self) -> u64 {
        if let Some(mut conn) = self.shared.clone() {
            match conn.incr::<_, _, u64>(DATA_VERSION_KEY, 1).await {
                Ok(v) => {
                    self.version = v;
                    tracing::info!(version = v, "Bumped cache data version");
                    return v;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to bump cache data version");
                }
            }
        }
        self.version += 1;
        self.local.invalidate_all();
        self.version
    }

    // --- Key builders ---
    //
    // Keys are always derived from sorted parameter pairs so equivalent
    // requests in different parameter orders share an entry.

    pub fn map_key(&self, params: &[(&str, String)]) -> String {
        format!("map:{}:{}", self.version, hash_params(params))
    }

    pub fn search_page_key(&self, query: &str, page: i64) -> String {
        format!("search_page:{}:{}:{}", self.version, query, page)
    }

    pub fn search_pagination_key(&self, query: &str) -> String {
        format!("search_pagination:{}:{}", self.version, query)
    }

    pub fn tech_summary_key(&self, technology: &str) -> String {
        format!("tech_summary:{}:{}", self.version, technology.to_uppercase())
    }

    pub fn company_summary_key(&self, company: &str) -> String {
        format!(
            "company_summary:{}:{}",
            self.version,
            company.to_uppercase()
        )
    }

    pub fn postcode_key(&self, kind: &str, postcode: &str) -> String {
        format!(
            "postcode:{}:{}:{}",
            self.version,
            kind,
            postcode.to_uppercase().replace(' ', "")
        )
    }
}

fn hash_params(params: &[(&str, String)]) -> String {
    let mut pairs: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    let canonical = pairs.join("&");

    let mut hasher = Md5::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_only() -> CacheLayer {
        CacheLayer {
            enabled: true,
            local: LocalCache::builder()
                .max_capacity(LOCAL_CAPACITY)
                .time_to_live(LOCAL_TTL)
                .build(),
            shared: None,
            version: 7,
        }
    }

    #[test]
    fn map_key_is_order_independent() {
        let layer = local_only();
        let a = layer.map_key(&[
            ("technology", "Battery".into()),
            ("north", "55.0".into()),
            ("south", "50.0".into()),
        ]);
        let b = layer.map_key(&[
            ("south", "50.0".into()),
            ("technology", "Battery".into()),
            ("north", "55.0".into()),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn keys_embed_the_data_version() {
        let layer = local_only();
        assert!(layer.search_page_key("sw11", 1).contains(":7:"));
        assert!(layer.tech_summary_key("dsr").ends_with("DSR"));
    }

    #[tokio::test]
    async fn local_tier_round_trips() {
        let layer = local_only();
        let key = layer.search_page_key("battersea", 1);
        layer.set(&key, &vec![1, 2, 3], ttl::SEARCH).await;
        let got: Option<Vec<i32>> = layer.get(&key).await;
        assert_eq!(got, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn emergency_bypass_never_stores() {
        let layer = CacheLayer::disabled();
        let key = layer.search_page_key("battersea", 1);
        layer.set(&key, &vec![1, 2, 3], ttl::SEARCH).await;
        let got: Option<Vec<i32>> = layer.get(&key).await;
        assert_eq!(got, None);
    }
}
