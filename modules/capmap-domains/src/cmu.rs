//! CMU detail service: every location group containing a CMU, plus the
//! registry record behind it.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;

use capmap_common::registry::RegistryData;
use capmap_common::CapMapError;

use crate::locations::store::{self, CmuTotals, Sort, SortKey, SortOrder};
use crate::locations::{LocationFilters, LocationGroup};
use crate::search::parse_status;

/// Registry row keyed by CMU id; the payload is the untyped record from
/// the upstream register.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CmuRegistry {
    pub cmu_id: String,
    pub raw_data: Json<serde_json::Value>,
    pub last_updated: DateTime<Utc>,
}

impl CmuRegistry {
    pub async fn find(cmu_id: &str, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM cmu_registry WHERE cmu_id = $1")
            .bind(cmu_id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }
}

/// Strip an optional `cmu_` prefix and uppercase.
pub fn normalize_cmu_id(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = if trimmed.len() >= 4 && trimmed[..4].eq_ignore_ascii_case("cmu_") {
        &trimmed[4..]
    } else {
        trimmed
    };
    stripped.to_uppercase()
}

#[derive(Debug, Clone, Default)]
pub struct CmuDetailParams {
    pub page: i64,
    pub per_page: i64,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub status: Option<String>,
    pub auction: Option<String>,
}

/// Registry fields surfaced on the detail page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySummary {
    pub name: Option<String>,
    pub applicant: Option<String>,
    pub parent_company: Option<String>,
    pub derated_capacity_mw: Option<f64>,
    pub connection_capacity_mw: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmuDetail {
    pub found: bool,
    pub cmu_id: String,
    pub normalized_cmu_id: String,
    pub registry: RegistrySummary,
    pub groups: Vec<LocationGroup>,
    pub total_locations: i64,
    pub total_capacity: f64,
    pub total_components: i64,
    pub technologies: Vec<String>,
    pub companies: Vec<String>,
    pub auction_years: Vec<String>,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

/// Build the detail view. An unknown CMU is an empty result with
/// `found = false`, not an error.
pub async fn detail(
    raw_cmu_id: &str,
    params: &CmuDetailParams,
    pool: &PgPool,
) -> Result<CmuDetail, CapMapError> {
    let normalized = normalize_cmu_id(raw_cmu_id);
    if normalized.is_empty() {
        return Err(CapMapError::InvalidInput("empty CMU id".to_string()));
    }

    // capacity is the default sort here, unlike the search surface
    let sort = match params.sort_by.as_deref() {
        None | Some("") | Some("capacity") => Sort {
            key: SortKey::Capacity,
            order: parse_order(params.sort_order.as_deref())?,
        },
        Some("location") => Sort {
            key: SortKey::Location,
            order: parse_order(params.sort_order.as_deref())?,
        },
        Some("components") => Sort {
            key: SortKey::ComponentCount,
            order: parse_order(params.sort_order.as_deref())?,
        },
        Some("date") => Sort {
            key: SortKey::Date,
            order: parse_order(params.sort_order.as_deref())?,
        },
        Some(other) => {
            return Err(CapMapError::InvalidInput(format!(
                "unknown sort key: {other}"
            )))
        }
    };

    let filters = LocationFilters {
        is_active: parse_status(params.status.as_deref()),
        auction_year: params.auction.clone().filter(|a| !a.is_empty()),
        ..Default::default()
    };

    let registry = CmuRegistry::find(&normalized, pool)
        .await
        .map_err(|e| CapMapError::Store(e.to_string()))?;

    let page = store::by_cmu(&normalized, &filters, sort, params.page, params.per_page, pool)
        .await
        .map_err(|e| CapMapError::Store(e.to_string()))?;

    // totals follow the active filters; dropdown values always show the
    // whole CMU so filters can be widened again
    let totals: CmuTotals = store::cmu_totals(&normalized, &filters, pool)
        .await
        .map_err(|e| CapMapError::Store(e.to_string()))?;
    let (technologies, companies, auction_years) = store::cmu_facet_values(&normalized, pool)
        .await
        .map_err(|e| CapMapError::Store(e.to_string()))?;
    let exists = store::cmu_exists(&normalized, pool)
        .await
        .map_err(|e| CapMapError::Store(e.to_string()))?;

    let registry_summary = registry
        .as_ref()
        .map(|r| {
            let data = RegistryData::new(&r.raw_data);
            RegistrySummary {
                name: data.cmu_name().map(String::from),
                applicant: data.applicant().map(String::from),
                parent_company: data.parent_company().map(String::from),
                derated_capacity_mw: data.derated_capacity(),
                connection_capacity_mw: data.connection_capacity(),
            }
        })
        .unwrap_or_default();

    let found = registry.is_some() || exists;

    Ok(CmuDetail {
        found,
        cmu_id: raw_cmu_id.to_string(),
        normalized_cmu_id: normalized,
        registry: registry_summary,
        groups: page.items,
        total_locations: totals.total_locations,
        total_capacity: totals.total_capacity,
        total_components: totals.total_components,
        technologies,
        companies,
        auction_years,
        page: page.page,
        per_page: page.per_page,
        total_pages: page.total_pages,
    })
}

fn parse_order(sort_order: Option<&str>) -> Result<SortOrder, CapMapError> {
    match sort_order {
        None | Some("") | Some("desc") => Ok(SortOrder::Desc),
        Some("asc") => Ok(SortOrder::Asc),
        Some(other) => Err(CapMapError::InvalidInput(format!(
            "unknown sort order: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_prefix_and_uppercases() {
        assert_eq!(normalize_cmu_id("cmu_octo13"), "OCTO13");
        assert_eq!(normalize_cmu_id("CMU_OCTO13"), "OCTO13");
        assert_eq!(normalize_cmu_id("octo13"), "OCTO13");
        assert_eq!(normalize_cmu_id("  vit-304 "), "VIT-304");
    }

    #[test]
    fn short_ids_survive_normalization() {
        assert_eq!(normalize_cmu_id("ab"), "AB");
        assert_eq!(normalize_cmu_id("cmu"), "CMU");
    }
}
