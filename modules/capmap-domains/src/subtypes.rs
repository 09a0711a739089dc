//! Context-aware subcategory lists for the UI's category chips. Every
//! branch is an aggregate query over location_groups; rows are never
//! materialized to compute these.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

/// Residential aggregators pinned to the front of DSR / EV lists.
const OCTOPUS: &str = "OCTOPUS ENERGY LIMITED";
const AXLE: &str = "AXLE ENERGY LIMITED";

/// Named links and landing countries the interconnector fleet uses.
const INTERCONNECTOR_KEYWORDS: &[&str] = &[
    "BritNED",
    "EWIC",
    "Eleclink",
    "Greenlink",
    "IFA",
    "IFA2",
    "Moyle",
    "NEMO",
    "NSL",
    "NeuConnect",
    "VikingLink",
    "Netherlands",
    "Ireland",
    "France",
    "Belgium",
    "Norway",
    "Denmark",
    "Germany",
    "Northern Ireland",
    "Republic of Ireland",
    "interconnect",
];

/// Cap on the EV Charging list: two aggregators + top companies +
/// "Everything else".
const EV_LIST_CAP: usize = 11;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtypesResponse {
    pub subtypes: Vec<String>,
    pub category: String,
    pub company: String,
    pub period: String,
    pub count: usize,
}

pub fn period_is_active(period: &str) -> bool {
    matches!(period, "future" | "active")
}

/// Subtypes for one category chip, scoped to period and optional company.
pub async fn subtypes(
    category: &str,
    company: Option<&str>,
    period: &str,
    pool: &PgPool,
) -> Result<Vec<String>> {
    let is_active = period_is_active(period);
    let company = company.map(str::trim).filter(|c| !c.is_empty());

    match category {
        "Battery" => {
            battery_subtypes(is_active, company, pool).await
        }
        "Gas" | "OCGT" => {
            tech_keys_matching(
                is_active,
                company,
                &["Gas", "CCGT", "OCGT", "SCGT", "Reciprocating"],
                &[],
                pool,
            )
            .await
        }
        "Interconnector" => {
            tech_keys_matching(is_active, company, INTERCONNECTOR_KEYWORDS, &[], pool).await
        }
        "DSR" => {
            // a concrete company needs no further splitting
            if company.is_some() {
                Ok(Vec::new())
            } else {
                Ok(vec![
                    "Octopus".to_string(),
                    "Axle".to_string(),
                    "Everything else".to_string(),
                ])
            }
        }
        "EV Charging" => {
            if company.is_some() {
                Ok(Vec::new())
            } else {
                ev_charging_subtypes(is_active, pool).await
            }
        }
        other => tech_keys_matching(is_active, company, &[other], &[], pool).await,
    }
}

async fn battery_subtypes(
    is_active: bool,
    company: Option<&str>,
    pool: &PgPool,
) -> Result<Vec<String>> {
    tech_keys_matching(
        is_active,
        company,
        &["Storage", "Battery"],
        &["DSR", "Demand Side Response", "CHP", "Gas", "Solar", "Wind"],
        pool,
    )
    .await
}

/// Distinct technology keys matching any include pattern and none of the
/// excludes, over groups in the requested period.
async fn tech_keys_matching(
    is_active: bool,
    company: Option<&str>,
    includes: &[&str],
    excludes: &[&str],
    pool: &PgPool,
) -> Result<Vec<String>> {
    let mut qb = sqlx::QueryBuilder::new(
        "SELECT DISTINCT value FROM location_groups lg, \
         LATERAL jsonb_object_keys(lg.technologies) AS value \
         WHERE lg.is_active = ",
    );
    qb.push_bind(is_active);
    qb.push(" ");

    if let Some(company) = company {
        qb.push("AND lg.companies ? ");
        qb.push_bind(company.to_string());
        qb.push(" ");
    }

    qb.push("AND (");
    for (i, pattern) in includes.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        qb.push("value ILIKE ");
        qb.push_bind(format!("%{pattern}%"));
    }
    qb.push(") ");

    for pattern in excludes {
        qb.push("AND value NOT ILIKE ");
        qb.push_bind(format!("%{pattern}%"));
        qb.push(" ");
    }

    qb.push("ORDER BY value ASC");

    let rows: Vec<(String,)> = qb.build_query_as().fetch_all(pool).await?;
    Ok(rows.into_iter().map(|(v,)| v).collect())
}

/// EV Charging subtypes are company names: the residential aggregators
/// when present, then top companies by location count, then the catch-all.
async fn ev_charging_subtypes(is_active: bool, pool: &PgPool) -> Result<Vec<String>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT value, COUNT(*) AS count FROM location_groups lg, \
         LATERAL jsonb_object_keys(lg.companies) AS value \
         WHERE lg.is_active = $1 AND lg.technologies ? 'EV Charging' \
         GROUP BY value ORDER BY count DESC, value ASC",
    )
    .bind(is_active)
    .fetch_all(pool)
    .await?;

    let mut subtypes = Vec::new();
    if rows.iter().any(|(name, _)| name == OCTOPUS) {
        subtypes.push("Octopus".to_string());
    }
    if rows.iter().any(|(name, _)| name == AXLE) {
        subtypes.push("Axle".to_string());
    }

    let remaining = (EV_LIST_CAP - 1).saturating_sub(subtypes.len());
    subtypes.extend(
        rows.iter()
            .filter(|(name, _)| name != OCTOPUS && name != AXLE)
            .take(remaining)
            .map(|(name, _)| name.clone()),
    );
    subtypes.push("Everything else".to_string());

    Ok(subtypes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_vocabulary() {
        assert!(period_is_active("future"));
        assert!(period_is_active("active"));
        assert!(!period_is_active("historical"));
        assert!(!period_is_active(""));
    }
}
