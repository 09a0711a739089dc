use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use capmap_common::technology;
use capmap_common::types::CmuIdSet;

/// Full column list for the row type below. `search_vector` is deliberately
/// absent: it is trigger-maintained and never read by the application.
pub const FULL_COLUMNS: &str = "lg.id, lg.location, lg.component_count, \
    lg.displayed_capacity_mw, lg.normalized_capacity_mw, lg.capacity_confidence, \
    lg.capacity_source, lg.capacity_calculation_notes, lg.is_aggregated_cmu, \
    lg.cmu_location_count, lg.auction_years, lg.technologies, lg.companies, \
    lg.descriptions, lg.cmu_ids, lg.is_active, lg.representative_component_id, \
    lg.latitude, lg.longitude, lg.county, lg.outward_code, lg.created_at, lg.updated_at";

/// Compact projection for list views. Omits the large JSON columns so a
/// page of rows stays small on the wire.
pub const SUMMARY_COLUMNS: &str = "lg.id, lg.location, lg.component_count, \
    lg.technologies, lg.auction_years, lg.normalized_capacity_mw, \
    lg.capacity_confidence, lg.is_active, lg.county, lg.outward_code";

/// Denormalized, read-optimized row per canonical location. Written only
/// by the builder; request handling never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocationGroup {
    pub id: i64,
    pub location: String,
    pub component_count: i32,
    pub displayed_capacity_mw: f64,
    pub normalized_capacity_mw: f64,
    pub capacity_confidence: String,
    pub capacity_source: Option<String>,
    pub capacity_calculation_notes: Option<String>,
    pub is_aggregated_cmu: bool,
    pub cmu_location_count: i32,
    pub auction_years: Json<Vec<String>>,
    pub technologies: Json<BTreeMap<String, i64>>,
    pub companies: Json<BTreeMap<String, i64>>,
    pub descriptions: Json<Vec<String>>,
    pub cmu_ids: Json<CmuIdSet>,
    pub is_active: bool,
    pub representative_component_id: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub county: Option<String>,
    pub outward_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocationGroup {
    /// Technology shown for this location when nothing specific was asked.
    pub fn primary_technology(&self) -> &str {
        technology::primary_technology(&self.technologies).unwrap_or("Unknown")
    }

    /// Most common company at this location.
    pub fn primary_company(&self) -> Option<&str> {
        self.companies
            .iter()
            .max_by(|(a_name, a_count), (b_name, b_count)| {
                a_count.cmp(b_count).then(b_name.cmp(a_name))
            })
            .map(|(name, _)| name.as_str())
    }

    /// Capacity sentence with aggregation context.
    pub fn display_capacity(&self) -> String {
        if self.capacity_confidence == "none" {
            return "No capacity data".to_string();
        }
        if self.is_aggregated_cmu {
            format!(
                "{:.2} MW (part of {:.2} MW aggregated CMU)",
                self.normalized_capacity_mw, self.displayed_capacity_mw
            )
        } else {
            format!("{:.2} MW", self.normalized_capacity_mw)
        }
    }
}

/// Compact row for paginated lists.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocationGroupSummary {
    pub id: i64,
    pub location: String,
    pub component_count: i32,
    pub technologies: Json<BTreeMap<String, i64>>,
    pub auction_years: Json<Vec<String>>,
    pub normalized_capacity_mw: f64,
    pub capacity_confidence: String,
    pub is_active: bool,
    pub county: Option<String>,
    pub outward_code: Option<String>,
}

impl LocationGroupSummary {
    pub fn primary_technology(&self) -> &str {
        technology::primary_technology(&self.technologies).unwrap_or("Unknown")
    }
}

/// Row shape for map viewport queries: coordinates guaranteed present.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ViewportRow {
    pub id: i64,
    pub location: String,
    pub latitude: f64,
    pub longitude: f64,
    pub technologies: Json<BTreeMap<String, i64>>,
    pub companies: Json<BTreeMap<String, i64>>,
    pub descriptions: Json<Vec<String>>,
    pub component_count: i32,
    pub normalized_capacity_mw: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_with(techs: &[(&str, i64)], companies: &[(&str, i64)]) -> LocationGroup {
        LocationGroup {
            id: 1,
            location: "Test Site, London, SW11 1AA".into(),
            component_count: techs.iter().map(|(_, n)| n).sum::<i64>() as i32,
            displayed_capacity_mw: 10.0,
            normalized_capacity_mw: 10.0,
            capacity_confidence: "medium".into(),
            capacity_source: Some("derated".into()),
            capacity_calculation_notes: None,
            is_aggregated_cmu: false,
            cmu_location_count: 1,
            auction_years: Json(vec!["T-4 2024-25".into()]),
            technologies: Json(techs.iter().map(|(k, v)| (k.to_string(), *v)).collect()),
            companies: Json(companies.iter().map(|(k, v)| (k.to_string(), *v)).collect()),
            descriptions: Json(vec![]),
            cmu_ids: Json(CmuIdSet::Small(vec!["VIT304".into()])),
            is_active: true,
            representative_component_id: None,
            latitude: Some(51.47),
            longitude: Some(-0.17),
            county: None,
            outward_code: Some("SW11".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn primary_technology_prefers_specific_over_dsr() {
        let g = group_with(&[("DSR", 3), ("Battery", 1)], &[("ACME", 4)]);
        assert_eq!(g.primary_technology(), "Battery");
    }

    #[test]
    fn primary_company_is_most_common() {
        let g = group_with(&[("DSR", 3)], &[("ACME", 1), ("ZENITH", 2)]);
        assert_eq!(g.primary_company(), Some("ZENITH"));
    }

    #[test]
    fn aggregated_capacity_display_names_the_whole() {
        let mut g = group_with(&[("Battery", 1)], &[("ACME", 1)]);
        g.is_aggregated_cmu = true;
        g.displayed_capacity_mw = 10.0;
        g.normalized_capacity_mw = 1.0;
        assert_eq!(g.display_capacity(), "1.00 MW (part of 10.00 MW aggregated CMU)");
    }
}
