//! Batch builder: turns the component table into location_groups rows.
//! Single writer; readers may run concurrently and see either the old or
//! the new row for a location, never a torn one.

use std::collections::BTreeMap;

use anyhow::Result;
use sqlx::{Acquire, PgPool, Postgres, Transaction};

use capmap_common::types::{CapacityConfidence, CmuIdSet};
use capmap_common::years;

use crate::components::Component;

/// Locations per transaction.
const CHUNK_SIZE: usize = 50;
/// Stored descriptions per location.
const DESCRIPTION_LIMIT: usize = 5;
/// Stored auction years per location. The full set still decides
/// `is_active` before truncation.
const AUCTION_YEAR_LIMIT: usize = 5;

/// Bucket for components missing a technology or company name, so the
/// count-sum invariant holds for every group.
const UNKNOWN_KEY: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Skip locations that already have a row.
    Incremental,
    /// Truncate and rebuild everything.
    Full,
}

#[derive(Debug, Default)]
pub struct BuildStats {
    pub total: usize,
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Everything the builder computes for one location before writing.
#[derive(Debug, Clone)]
pub struct LocationDraft {
    pub location: String,
    pub component_count: i32,
    pub descriptions: Vec<String>,
    pub technologies: BTreeMap<String, i64>,
    pub companies: BTreeMap<String, i64>,
    pub auction_years: Vec<String>,
    pub cmu_ids: CmuIdSet,
    pub is_active: bool,
    pub displayed_capacity_mw: f64,
    pub normalized_capacity_mw: f64,
    pub capacity_source: String,
    pub capacity_confidence: CapacityConfidence,
    pub capacity_calculation_notes: String,
    pub is_aggregated_cmu: bool,
    pub cmu_location_count: i32,
    pub representative_component_id: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub county: Option<String>,
    pub outward_code: Option<String>,
    /// CMU sampled for aggregation detection.
    pub sample_cmu_id: Option<String>,
    has_any_capacity_value: bool,
}

/// Aggregate one location's components into a draft. Pure; the aggregated-
/// CMU adjustment happens afterwards via [`apply_cmu_aggregation`].
pub fn aggregate_components(location: &str, components: &[Component]) -> Option<LocationDraft> {
    if components.is_empty() {
        return None;
    }

    let mut descriptions: Vec<String> = Vec::new();
    for component in components {
        if let Some(desc) = component.description.as_deref() {
            if !desc.is_empty() && !descriptions.iter().any(|d| d == desc) {
                descriptions.push(desc.to_string());
            }
        }
    }
    descriptions.truncate(DESCRIPTION_LIMIT);

    let mut technologies: BTreeMap<String, i64> = BTreeMap::new();
    let mut companies: BTreeMap<String, i64> = BTreeMap::new();
    for component in components {
        let tech = component
            .technology
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(UNKNOWN_KEY);
        *technologies.entry(tech.to_string()).or_insert(0) += 1;

        let company = component
            .company_name
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(UNKNOWN_KEY);
        *companies.entry(company.to_string()).or_insert(0) += 1;
    }

    let mut auction_years: Vec<String> = Vec::new();
    for component in components {
        if let Some(auction) = component.auction_name.as_deref() {
            if !auction.is_empty() && !auction_years.iter().any(|a| a == auction) {
                auction_years.push(auction.to_string());
            }
        }
    }
    years::sort_newest_first(&mut auction_years);

    let mut cmu_ids: Vec<String> = components.iter().map(|c| c.cmu_id.clone()).collect();
    cmu_ids.sort();
    cmu_ids.dedup();

    let representative = components
        .iter()
        .find(|c| c.latitude.is_some() && c.longitude.is_some())
        .or_else(|| components.first());

    let displayed: f64 = components
        .iter()
        .map(|c| c.derated_capacity_mw.unwrap_or(0.0))
        .sum();
    let has_any_capacity_value = components.iter().any(|c| c.derated_capacity_mw.is_some());

    Some(LocationDraft {
        location: location.to_string(),
        component_count: components.len() as i32,
        descriptions,
        technologies,
        companies,
        cmu_ids: CmuIdSet::from_ids(cmu_ids),
        is_active: false,  // set by finish() once the cutoff is known
        displayed_capacity_mw: displayed,
        normalized_capacity_mw: displayed,
        capacity_source: "derated".to_string(),
        capacity_confidence: CapacityConfidence::None,
        capacity_calculation_notes: String::new(),
        is_aggregated_cmu: false,
        cmu_location_count: 1,
        representative_component_id: representative.map(|c| c.id),
        latitude: representative.and_then(|c| c.latitude),
        longitude: representative.and_then(|c| c.longitude),
        county: representative.and_then(|c| c.county.clone()),
        outward_code: representative.and_then(|c| c.outward_code.clone()),
        sample_cmu_id: components.first().map(|c| c.cmu_id.clone()),
        has_any_capacity_value,
        auction_years,
    })
}

impl LocationDraft {
    /// Resolve the active flag against the full auction-year set, then
    /// truncate the stored list.
    pub fn finish(&mut self, cutoff: i32) {
        self.is_active = years::is_active(&self.auction_years, cutoff);
        self.auction_years.truncate(AUCTION_YEAR_LIMIT);
    }
}

/// Apply aggregated-CMU capacity normalization. A CMU is aggregated when
/// it spans multiple locations and every location reports the same
/// capacity sum, which means the figure is administratively split.
pub fn apply_cmu_aggregation(
    draft: &mut LocationDraft,
    cmu_location_count: i64,
    per_location_sums: &[(String, f64)],
) {
    let all_equal = per_location_sums.len() > 1
        && per_location_sums
            .windows(2)
            .all(|w| (w[0].1 - w[1].1).abs() < 1e-6);

    if cmu_location_count > 1 && all_equal {
        draft.is_aggregated_cmu = true;
        draft.cmu_location_count = cmu_location_count as i32;
        draft.normalized_capacity_mw = draft.displayed_capacity_mw / cmu_location_count as f64;
        draft.capacity_source = "derated_aggregated".to_string();
        draft.capacity_confidence = CapacityConfidence::Medium;
        draft.capacity_calculation_notes = format!(
            "CMU {} spans {} locations with identical capacity; displayed total divided by location count",
            draft.sample_cmu_id.as_deref().unwrap_or("?"),
            cmu_location_count
        );
    } else {
        draft.normalized_capacity_mw = draft.displayed_capacity_mw;
        draft.capacity_source = "derated".to_string();
        draft.capacity_confidence = if !draft.has_any_capacity_value {
            CapacityConfidence::None
        } else if draft.displayed_capacity_mw == 0.0 {
            CapacityConfidence::Low
        } else {
            CapacityConfidence::Medium
        };
        draft.capacity_calculation_notes =
            "sum of component de-rated capacities at this location".to_string();
    }
}

enum WriteOutcome {
    Written,
    Skipped,
}

async fn write_draft(
    draft: &LocationDraft,
    upsert: bool,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<WriteOutcome> {
    let mut qb = sqlx::QueryBuilder::new(
        "INSERT INTO location_groups (location, component_count, displayed_capacity_mw, \
         normalized_capacity_mw, capacity_confidence, capacity_source, \
         capacity_calculation_notes, is_aggregated_cmu, cmu_location_count, auction_years, \
         technologies, companies, descriptions, cmu_ids, is_active, \
         representative_component_id, latitude, longitude, county, outward_code, updated_at) ",
    );

    qb.push("VALUES (");
    let mut sep = qb.separated(", ");
    sep.push_bind(draft.location.clone());
    sep.push_bind(draft.component_count);
    sep.push_bind(draft.displayed_capacity_mw);
    sep.push_bind(draft.normalized_capacity_mw);
    sep.push_bind(draft.capacity_confidence.as_str());
    sep.push_bind(draft.capacity_source.clone());
    sep.push_bind(draft.capacity_calculation_notes.clone());
    sep.push_bind(draft.is_aggregated_cmu);
    sep.push_bind(draft.cmu_location_count);
    sep.push_bind(sqlx::types::Json(draft.auction_years.clone()));
    sep.push_bind(sqlx::types::Json(draft.technologies.clone()));
    sep.push_bind(sqlx::types::Json(draft.companies.clone()));
    sep.push_bind(sqlx::types::Json(draft.descriptions.clone()));
    sep.push_bind(sqlx::types::Json(draft.cmu_ids.clone()));
    sep.push_bind(draft.is_active);
    sep.push_bind(draft.representative_component_id);
    sep.push_bind(draft.latitude);
    sep.push_bind(draft.longitude);
    sep.push_bind(draft.county.clone());
    sep.push_bind(draft.outward_code.clone());
    qb.push(", now())");

    if !upsert {
        // incremental mode: a concurrent worker may have won this location
        qb.push(" ON CONFLICT (location) DO NOTHING");
    } else {
        qb.push(
            " ON CONFLICT (location) DO UPDATE SET \
             component_count = EXCLUDED.component_count, \
             displayed_capacity_mw = EXCLUDED.displayed_capacity_mw, \
             normalized_capacity_mw = EXCLUDED.normalized_capacity_mw, \
             capacity_confidence = EXCLUDED.capacity_confidence, \
             capacity_source = EXCLUDED.capacity_source, \
             capacity_calculation_notes = EXCLUDED.capacity_calculation_notes, \
             is_aggregated_cmu = EXCLUDED.is_aggregated_cmu, \
             cmu_location_count = EXCLUDED.cmu_location_count, \
             auction_years = EXCLUDED.auction_years, \
             technologies = EXCLUDED.technologies, \
             companies = EXCLUDED.companies, \
             descriptions = EXCLUDED.descriptions, \
             cmu_ids = EXCLUDED.cmu_ids, \
             is_active = EXCLUDED.is_active, \
             representative_component_id = EXCLUDED.representative_component_id, \
             latitude = EXCLUDED.latitude, \
             longitude = EXCLUDED.longitude, \
             county = EXCLUDED.county, \
             outward_code = EXCLUDED.outward_code, \
             updated_at = now()",
        );
    }

    match qb.build().execute(&mut **tx).await {
        Ok(result) if result.rows_affected() == 0 => Ok(WriteOutcome::Skipped),
        Ok(_) => Ok(WriteOutcome::Written),
        Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
            // another worker built this location first
            Ok(WriteOutcome::Skipped)
        }
        Err(e) => Err(e.into()),
    }
}

async fn process_location(
    location: &str,
    cutoff: i32,
    upsert: bool,
    pool: &PgPool,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<WriteOutcome> {
    let components = Component::at_location(location, pool).await?;
    let Some(mut draft) = aggregate_components(location, &components) else {
        return Ok(WriteOutcome::Skipped);
    };

    if let Some(cmu_id) = draft.sample_cmu_id.clone() {
        let location_count = Component::location_count_for_cmu(&cmu_id, pool).await?;
        let sums = if location_count > 1 {
            Component::capacity_by_location_for_cmu(&cmu_id, pool).await?
        } else {
            Vec::new()
        };
        apply_cmu_aggregation(&mut draft, location_count, &sums);
    } else {
        apply_cmu_aggregation(&mut draft, 1, &[]);
    }

    draft.finish(cutoff);

    // savepoint so one bad location cannot abort the whole chunk
    let mut savepoint = tx.begin().await?;
    match write_draft(&draft, upsert, &mut savepoint).await {
        Ok(outcome) => {
            savepoint.commit().await?;
            Ok(outcome)
        }
        Err(e) => {
            savepoint.rollback().await?;
            Err(e)
        }
    }
}

/// Run the build. Per-location failures are logged and skipped; the batch
/// always continues.
pub async fn build_location_groups(
    mode: BuildMode,
    limit: Option<i64>,
    cutoff: i32,
    pool: &PgPool,
) -> Result<BuildStats> {
    if mode == BuildMode::Full {
        tracing::info!("Full rebuild: truncating location_groups");
        sqlx::query("TRUNCATE location_groups").execute(pool).await?;
    }

    let incremental = mode == BuildMode::Incremental;
    let locations = Component::distinct_locations_for_build(incremental, limit, pool).await?;
    let mut stats = BuildStats {
        total: locations.len(),
        ..Default::default()
    };
    tracing::info!(locations = stats.total, ?mode, "Building location groups");

    let upsert = mode == BuildMode::Full;
    for chunk in locations.chunks(CHUNK_SIZE) {
        let mut tx = pool.begin().await?;
        for location in chunk {
            match process_location(location, cutoff, upsert, pool, &mut tx).await {
                Ok(WriteOutcome::Written) => stats.written += 1,
                Ok(WriteOutcome::Skipped) => stats.skipped += 1,
                Err(e) => {
                    tracing::warn!(location = %location, error = %e, "Failed to build location, skipping");
                    stats.failed += 1;
                }
            }

            let done = stats.written + stats.skipped + stats.failed;
            if done % 100 == 0 {
                tracing::info!(done, total = stats.total, "Build progress");
            }
        }
        tx.commit().await?;
    }

    tracing::info!(
        written = stats.written,
        skipped = stats.skipped,
        failed = stats.failed,
        "Build complete"
    );
    Ok(stats)
}

/// Post-build taxonomy passes. Purely additive: the added key mirrors
/// `component_count` and never changes it.
pub async fn apply_taxonomy_augmentations(pool: &PgPool) -> Result<(u64, u64)> {
    let battery = sqlx::query(
        "UPDATE location_groups \
         SET technologies = technologies || jsonb_build_object('Battery', component_count) \
         WHERE NOT technologies ? 'Battery' \
           AND EXISTS (SELECT 1 FROM jsonb_object_keys(technologies) AS k WHERE k LIKE 'Storage%')",
    )
    .execute(pool)
    .await?
    .rows_affected();

    let pumped_hydro = sqlx::query(
        "UPDATE location_groups \
         SET technologies = technologies || jsonb_build_object('Pumped Hydro', component_count) \
         WHERE NOT technologies ? 'Pumped Hydro' \
           AND EXISTS (SELECT 1 FROM jsonb_array_elements_text(descriptions) AS d \
                       WHERE d ~* 'pumped (storage|hydro)')",
    )
    .execute(pool)
    .await?
    .rows_affected();

    tracing::info!(battery, pumped_hydro, "Taxonomy augmentations applied");
    Ok((battery, pumped_hydro))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sqlx::types::Json;

    fn component(
        id: i64,
        cmu: &str,
        tech: Option<&str>,
        company: Option<&str>,
        auction: Option<&str>,
        capacity: Option<f64>,
        coords: Option<(f64, f64)>,
    ) -> Component {
        Component {
            id,
            component_id: Some(format!("EXT{id}")),
            cmu_id: cmu.to_string(),
            location: Some("Test Site".to_string()),
            description: Some(format!("Engine {id}")),
            technology: tech.map(String::from),
            company_name: company.map(String::from),
            auction_name: auction.map(String::from),
            delivery_year: Some("2024".to_string()),
            status: None,
            additional_data: Json(serde_json::json!({})),
            derated_capacity_mw: capacity,
            latitude: coords.map(|(lat, _)| lat),
            longitude: coords.map(|(_, lon)| lon),
            geocoded: coords.is_some(),
            county: Some("Greater London".to_string()),
            outward_code: Some("SW11".to_string()),
            full_postcode: Some("SW11 1AA".to_string()),
            places_api_business_name: None,
            places_api_business_type: None,
            places_api_confidence: None,
            places_api_major_retailers: Json(vec![]),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn counts_match_across_maps() {
        let comps = vec![
            component(1, "VIT304", Some("Gas"), Some("ACME"), Some("T-4 2024-25"), Some(5.0), None),
            component(2, "VIT304", Some("Gas"), Some("ACME"), Some("T-4 2024-25"), Some(5.0), None),
            component(3, "VIT305", Some("Battery"), Some("ZEN"), Some("T-1 2023-24"), None, None),
        ];
        let draft = aggregate_components("Test Site", &comps).unwrap();
        assert_eq!(draft.component_count, 3);
        assert_eq!(draft.technologies.values().sum::<i64>(), 3);
        assert_eq!(draft.companies.values().sum::<i64>(), 3);
    }

    #[test]
    fn missing_names_bucket_as_unknown_to_keep_sums() {
        let comps = vec![
            component(1, "A1", None, Some("ACME"), None, None, None),
            component(2, "A1", Some("Gas"), None, None, None, None),
        ];
        let draft = aggregate_components("Test Site", &comps).unwrap();
        assert_eq!(draft.technologies.get("Unknown"), Some(&1));
        assert_eq!(draft.companies.get("Unknown"), Some(&1));
        assert_eq!(draft.technologies.values().sum::<i64>(), 2);
        assert_eq!(draft.companies.values().sum::<i64>(), 2);
    }

    #[test]
    fn active_flag_follows_cutoff_over_full_year_set() {
        let comps = vec![
            component(1, "A1", Some("Gas"), Some("ACME"), Some("T-4 2019-20"), None, None),
            component(2, "A1", Some("Gas"), Some("ACME"), Some("T-4 2025-26"), None, None),
        ];
        let mut draft = aggregate_components("Test Site", &comps).unwrap();
        draft.finish(2024);
        assert!(draft.is_active);

        let mut draft = aggregate_components("Test Site", &comps[..1]).unwrap();
        draft.finish(2024);
        assert!(!draft.is_active);
    }

    #[test]
    fn auction_years_sorted_newest_first_and_truncated() {
        let auctions = [
            "T-4 2019-20", "T-4 2020-21", "T-4 2021-22", "T-4 2022-23", "T-4 2026-27",
            "T-4 2024-25", "T-1 2025-26",
        ];
        let comps: Vec<Component> = auctions
            .iter()
            .enumerate()
            .map(|(i, a)| {
                component(i as i64, "A1", Some("Gas"), Some("ACME"), Some(a), None, None)
            })
            .collect();
        let mut draft = aggregate_components("Test Site", &comps).unwrap();
        draft.finish(2024);
        assert_eq!(draft.auction_years.len(), AUCTION_YEAR_LIMIT);
        assert_eq!(draft.auction_years[0], "T-4 2026-27");
        assert_eq!(draft.auction_years[1], "T-1 2025-26");
    }

    #[test]
    fn representative_prefers_coordinates() {
        let comps = vec![
            component(1, "A1", Some("Gas"), Some("ACME"), None, None, None),
            component(2, "A1", Some("Gas"), Some("ACME"), None, None, Some((51.5, -0.1))),
        ];
        let draft = aggregate_components("Test Site", &comps).unwrap();
        assert_eq!(draft.representative_component_id, Some(2));
        assert_eq!(draft.latitude, Some(51.5));
    }

    #[test]
    fn aggregated_cmu_normalizes_capacity() {
        let comps = vec![component(
            1, "OCTO13", Some("DSR"), Some("OCTOPUS ENERGY LIMITED"),
            Some("T-4 2024-25"), Some(10.0), None,
        )];
        let mut draft = aggregate_components("Test Site", &comps).unwrap();

        let sums: Vec<(String, f64)> = (0..10).map(|i| (format!("Site {i}"), 10.0)).collect();
        apply_cmu_aggregation(&mut draft, 10, &sums);
        draft.finish(2024);

        assert!(draft.is_aggregated_cmu);
        assert_eq!(draft.cmu_location_count, 10);
        assert_eq!(draft.displayed_capacity_mw, 10.0);
        assert_eq!(draft.normalized_capacity_mw, 1.0);
        assert_eq!(draft.capacity_confidence, CapacityConfidence::Medium);
        assert_eq!(draft.capacity_source, "derated_aggregated");
    }

    #[test]
    fn unequal_location_sums_are_not_aggregated() {
        let comps = vec![component(
            1, "VIT304", Some("Gas"), Some("ACME"), None, Some(8.0), None,
        )];
        let mut draft = aggregate_components("Test Site", &comps).unwrap();
        let sums = vec![("A".to_string(), 8.0), ("B".to_string(), 4.0)];
        apply_cmu_aggregation(&mut draft, 2, &sums);

        assert!(!draft.is_aggregated_cmu);
        assert_eq!(draft.normalized_capacity_mw, 8.0);
        assert_eq!(draft.capacity_confidence, CapacityConfidence::Medium);
    }

    #[test]
    fn capacity_confidence_tiers() {
        // no capacity values at all
        let comps = vec![component(1, "A1", Some("Gas"), Some("ACME"), None, None, None)];
        let mut draft = aggregate_components("Test Site", &comps).unwrap();
        apply_cmu_aggregation(&mut draft, 1, &[]);
        assert_eq!(draft.capacity_confidence, CapacityConfidence::None);

        // explicit zero
        let comps = vec![component(1, "A1", Some("Gas"), Some("ACME"), None, Some(0.0), None)];
        let mut draft = aggregate_components("Test Site", &comps).unwrap();
        apply_cmu_aggregation(&mut draft, 1, &[]);
        assert_eq!(draft.capacity_confidence, CapacityConfidence::Low);
    }

    #[test]
    fn cmu_ids_switch_to_large_form_past_threshold() {
        let comps: Vec<Component> = (0..25)
            .map(|i| {
                component(i, &format!("CMU{i:03}"), Some("DSR"), Some("ACME"), None, None, None)
            })
            .collect();
        let draft = aggregate_components("Test Site", &comps).unwrap();
        match &draft.cmu_ids {
            CmuIdSet::Large { count, sample } => {
                assert_eq!(*count, 25);
                assert_eq!(sample.len(), 5);
            }
            other => panic!("expected large form, got {other:?}"),
        }
    }

    #[test]
    fn descriptions_deduplicated_and_capped() {
        let mut comps: Vec<Component> = (0..8)
            .map(|i| component(i, "A1", Some("Gas"), Some("ACME"), None, None, None))
            .collect();
        comps[1].description = comps[0].description.clone();
        let draft = aggregate_components("Test Site", &comps).unwrap();
        assert_eq!(draft.descriptions.len(), DESCRIPTION_LIMIT);
        let mut sorted = draft.descriptions.clone();
        sorted.dedup();
        assert_eq!(sorted.len(), draft.descriptions.len());
    }

    #[test]
    fn empty_component_slice_yields_no_draft() {
        assert!(aggregate_components("Nowhere", &[]).is_none());
    }
}
