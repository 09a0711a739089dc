//! Read interface over the raw component table. Rows are owned by the
//! external loader; this side only filters and counts.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;

/// One auction participation of one asset at one location.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Component {
    pub id: i64,
    pub component_id: Option<String>,
    pub cmu_id: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub technology: Option<String>,
    pub company_name: Option<String>,
    pub auction_name: Option<String>,
    pub delivery_year: Option<String>,
    pub status: Option<String>,
    pub additional_data: Json<serde_json::Value>,
    pub derated_capacity_mw: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub geocoded: bool,
    pub county: Option<String>,
    pub outward_code: Option<String>,
    pub full_postcode: Option<String>,
    pub places_api_business_name: Option<String>,
    pub places_api_business_type: Option<String>,
    pub places_api_confidence: Option<f64>,
    pub places_api_major_retailers: Json<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Optional equality filters, combined with AND.
#[derive(Debug, Clone, Default)]
pub struct ComponentFilter {
    pub cmu_id: Option<String>,
    pub location: Option<String>,
    pub technology: Option<String>,
    pub company: Option<String>,
    pub year: Option<String>,
    pub outward_code: Option<String>,
}

/// Location values that mean "no location". Components carrying these are
/// excluded from the build.
const SENTINEL_LOCATIONS: &[&str] = &["None", "N/A", "NA"];

impl Component {
    pub async fn find_by_id(id: i64, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM components WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn filter(f: &ComponentFilter, pool: &PgPool) -> Result<Vec<Self>> {
        let mut qb = sqlx::QueryBuilder::new("SELECT * FROM components WHERE 1=1 ");
        push_component_filters(&mut qb, f);
        qb.push("ORDER BY delivery_year DESC, id ASC");
        qb.build_query_as::<Self>()
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn count(f: &ComponentFilter, pool: &PgPool) -> Result<i64> {
        let mut qb = sqlx::QueryBuilder::new("SELECT COUNT(*) FROM components WHERE 1=1 ");
        push_component_filters(&mut qb, f);
        let (count,): (i64,) = qb.build_query_as().fetch_one(pool).await?;
        Ok(count)
    }

    /// All components at one canonical location, build order.
    pub async fn at_location(location: &str, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM components WHERE location = $1 ORDER BY id ASC")
            .bind(location)
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }

    /// Components for the location detail view, grouped downstream by
    /// description, CMU and auction.
    pub async fn for_location_detail(
        location: &str,
        cmu_id: Option<&str>,
        auction: Option<&str>,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        let mut qb = sqlx::QueryBuilder::new("SELECT * FROM components WHERE location = ");
        qb.push_bind(location);
        if let Some(cmu) = cmu_id {
            qb.push(" AND cmu_id = ");
            qb.push_bind(cmu);
        }
        if let Some(auction) = auction {
            qb.push(" AND auction_name ILIKE ");
            qb.push_bind(format!("%{auction}%"));
        }
        qb.push(" ORDER BY description ASC, cmu_id ASC, delivery_year DESC");
        qb.build_query_as::<Self>()
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }

    /// Distinct buildable locations. Incremental mode skips locations that
    /// already have a LocationGroup row.
    pub async fn distinct_locations_for_build(
        incremental: bool,
        limit: Option<i64>,
        pool: &PgPool,
    ) -> Result<Vec<String>> {
        let mut qb = sqlx::QueryBuilder::new(
            "SELECT DISTINCT location FROM components \
             WHERE location IS NOT NULL AND location <> '' ",
        );
        for sentinel in SENTINEL_LOCATIONS {
            qb.push("AND location <> ");
            qb.push_bind(*sentinel);
            qb.push(" ");
        }
        qb.push("AND location NOT ILIKE '%TBC%' AND location NOT ILIKE '%to be confirmed%' ");
        if incremental {
            qb.push("AND location NOT IN (SELECT location FROM location_groups) ");
        }
        qb.push("ORDER BY location ASC ");
        if let Some(limit) = limit {
            qb.push("LIMIT ");
            qb.push_bind(limit);
        }

        let rows: Vec<(String,)> = qb.build_query_as().fetch_all(pool).await?;
        Ok(rows.into_iter().map(|(l,)| l).collect())
    }

    /// How many distinct locations a CMU spans. Drives aggregated-CMU
    /// detection.
    pub async fn location_count_for_cmu(cmu_id: &str, pool: &PgPool) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT location) FROM components \
             WHERE cmu_id = $1 AND location IS NOT NULL AND location <> ''",
        )
        .bind(cmu_id)
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    /// Per-location de-rated capacity sums for one CMU.
    pub async fn capacity_by_location_for_cmu(
        cmu_id: &str,
        pool: &PgPool,
    ) -> Result<Vec<(String, f64)>> {
        let rows: Vec<(String, f64)> = sqlx::query_as(
            "SELECT location, COALESCE(SUM(derated_capacity_mw), 0) \
             FROM components \
             WHERE cmu_id = $1 AND location IS NOT NULL AND location <> '' \
             GROUP BY location",
        )
        .bind(cmu_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

fn push_component_filters(
    qb: &mut sqlx::QueryBuilder<'_, sqlx::Postgres>,
    f: &ComponentFilter,
) {
    if let Some(cmu_id) = &f.cmu_id {
        qb.push("AND cmu_id = ");
        qb.push_bind(cmu_id.clone());
        qb.push(" ");
    }
    if let Some(location) = &f.location {
        qb.push("AND location = ");
        qb.push_bind(location.clone());
        qb.push(" ");
    }
    if let Some(technology) = &f.technology {
        // functional index on UPPER(technology)
        qb.push("AND UPPER(technology) = UPPER(");
        qb.push_bind(technology.clone());
        qb.push(") ");
    }
    if let Some(company) = &f.company {
        qb.push("AND company_name = ");
        qb.push_bind(company.clone());
        qb.push(" ");
    }
    if let Some(year) = &f.year {
        qb.push("AND delivery_year = ");
        qb.push_bind(year.clone());
        qb.push(" ");
    }
    if let Some(outward) = &f.outward_code {
        qb.push("AND outward_code = ");
        qb.push_bind(outward.clone());
        qb.push(" ");
    }
}

/// Location detail rows organized description → CMU → auction, preserving
/// the fetch order within each bucket.
#[derive(Debug, Serialize)]
pub struct DetailDescription {
    pub description: String,
    pub cmus: Vec<DetailCmu>,
}

#[derive(Debug, Serialize)]
pub struct DetailCmu {
    pub cmu_id: String,
    pub company: Option<String>,
    pub technology: Option<String>,
    pub auctions: Vec<DetailAuction>,
}

#[derive(Debug, Serialize)]
pub struct DetailAuction {
    pub auction: String,
    pub components: Vec<Component>,
}

pub fn organize_for_detail(components: Vec<Component>) -> Vec<DetailDescription> {
    let mut organized: Vec<DetailDescription> = Vec::new();

    for component in components {
        let desc = component
            .description
            .clone()
            .unwrap_or_else(|| "No description".to_string());
        let auction = component
            .auction_name
            .clone()
            .unwrap_or_else(|| "Unknown auction".to_string());

        let desc_entry = match organized.iter_mut().position(|d| d.description == desc) {
            Some(i) => &mut organized[i],
            None => {
                organized.push(DetailDescription {
                    description: desc,
                    cmus: Vec::new(),
                });
                organized.last_mut().unwrap()
            }
        };

        let cmu_entry = match desc_entry
            .cmus
            .iter_mut()
            .position(|c| c.cmu_id == component.cmu_id)
        {
            Some(i) => &mut desc_entry.cmus[i],
            None => {
                desc_entry.cmus.push(DetailCmu {
                    cmu_id: component.cmu_id.clone(),
                    company: component.company_name.clone(),
                    technology: component.technology.clone(),
                    auctions: Vec::new(),
                });
                desc_entry.cmus.last_mut().unwrap()
            }
        };

        let auction_entry = match cmu_entry.auctions.iter_mut().position(|a| a.auction == auction) {
            Some(i) => &mut cmu_entry.auctions[i],
            None => {
                cmu_entry.auctions.push(DetailAuction {
                    auction,
                    components: Vec::new(),
                });
                cmu_entry.auctions.last_mut().unwrap()
            }
        };
        auction_entry.components.push(component);
    }

    organized
}
