//! Aggregated technology and company summaries for landing pages, and the
//! pre-warm pass that fills the cache after a rebuild.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use capmap_core::cache::ttl;
use capmap_core::ServerDeps;

/// Technologies pre-warmed after a rebuild. DSR is deliberately absent:
/// its aggregation is the largest in the fleet and blows the shared cache
/// memory budget, so services must never assume a DSR summary is cached.
const WARM_TECH_LIMIT: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TechnologySummary {
    pub technology: String,
    pub location_count: i64,
    pub component_count: i64,
    pub total_capacity_mw: f64,
    pub company_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CompanySummary {
    pub company: String,
    pub location_count: i64,
    pub component_count: i64,
    pub total_capacity_mw: f64,
}

/// Aggregate one technology across all active location groups.
pub async fn technology_summary(technology: &str, pool: &PgPool) -> Result<TechnologySummary> {
    let row: TechnologySummary = sqlx::query_as(
        "WITH scoped AS ( \
             SELECT lg.id, COALESCE((lg.technologies ->> $1)::bigint, 0) AS tech_count, \
                    lg.normalized_capacity_mw AS capacity, lg.companies \
             FROM location_groups lg \
             WHERE lg.is_active = TRUE AND lg.technologies ? $1 \
         ) \
         SELECT $1 AS technology, \
                (SELECT COUNT(*) FROM scoped) AS location_count, \
                (SELECT COALESCE(SUM(tech_count), 0)::bigint FROM scoped) AS component_count, \
                (SELECT COALESCE(SUM(capacity), 0) FROM scoped) AS total_capacity_mw, \
                (SELECT COUNT(DISTINCT k) FROM scoped, \
                        LATERAL jsonb_object_keys(scoped.companies) AS k) AS company_count",
    )
    .bind(technology)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

pub async fn company_summary(company: &str, pool: &PgPool) -> Result<CompanySummary> {
    let row: CompanySummary = sqlx::query_as(
        "SELECT $1 AS company, \
                COUNT(*) AS location_count, \
                COALESCE(SUM(COALESCE((lg.companies ->> $1)::bigint, 0)), 0)::bigint AS component_count, \
                COALESCE(SUM(lg.normalized_capacity_mw), 0) AS total_capacity_mw \
         FROM location_groups lg \
         WHERE lg.is_active = TRUE AND lg.companies ? $1",
    )
    .bind(company)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Cached summary lookup for the landing pages.
pub async fn cached_technology_summary(
    technology: &str,
    deps: &ServerDeps,
) -> Result<TechnologySummary> {
    let key = deps.cache.tech_summary_key(technology);
    if let Some(summary) = deps.cache.get::<TechnologySummary>(&key).await {
        return Ok(summary);
    }
    let summary = technology_summary(technology, deps.pool()).await?;
    deps.cache.set(&key, &summary, ttl::SUMMARY).await;
    Ok(summary)
}

/// Pre-warm summaries for the biggest technologies, skipping DSR.
pub async fn warm_summaries(deps: &ServerDeps) -> Result<usize> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT value FROM location_groups lg, \
         LATERAL jsonb_object_keys(lg.technologies) AS value \
         WHERE lg.is_active = TRUE \
         GROUP BY value ORDER BY COUNT(*) DESC LIMIT $1",
    )
    .bind(WARM_TECH_LIMIT)
    .fetch_all(deps.pool())
    .await?;

    let mut warmed = 0;
    for (technology,) in rows {
        if technology == "DSR" {
            tracing::info!("Skipping DSR summary pre-warm, aggregation too large to cache");
            continue;
        }
        let key = deps.cache.tech_summary_key(&technology);
        let summary = technology_summary(&technology, deps.pool()).await?;
        deps.cache.set(&key, &summary, ttl::SUMMARY).await;
        warmed += 1;
    }

    tracing::info!(warmed, "Technology summaries pre-warmed");
    Ok(warmed)
}
