//! Invariants that must hold for every built location group, exercised
//! over constructed component data.

use chrono::Utc;
use sqlx::types::Json;

use capmap_common::geo::is_uk_coordinate;
use capmap_common::types::{CapacityConfidence, CmuIdSet};
use capmap_common::years;
use capmap_domains::builder::{aggregate_components, apply_cmu_aggregation};
use capmap_domains::components::Component;
use capmap_domains::subtypes;

fn component(id: i64, cmu: &str, auction: &str, capacity: Option<f64>) -> Component {
    Component {
        id,
        component_id: Some(format!("EXT{id}")),
        cmu_id: cmu.to_string(),
        location: Some("Unit 5, Riverside Industrial Estate".to_string()),
        description: Some(format!("Gas engine {id}")),
        technology: Some("Gas".to_string()),
        company_name: Some("RIVERSIDE POWER LIMITED".to_string()),
        auction_name: Some(auction.to_string()),
        delivery_year: Some("2024".to_string()),
        status: None,
        additional_data: Json(serde_json::json!({})),
        derated_capacity_mw: capacity,
        latitude: Some(53.4),
        longitude: Some(-1.5),
        geocoded: true,
        county: Some("South Yorkshire".to_string()),
        outward_code: Some("S9".to_string()),
        full_postcode: Some("S9 1AA".to_string()),
        places_api_business_name: None,
        places_api_business_type: None,
        places_api_confidence: None,
        places_api_major_retailers: Json(vec![]),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[test]
fn component_count_equals_technology_and_company_sums() {
    let comps: Vec<Component> = (0..7)
        .map(|i| component(i, "RIV001", "T-4 2024-25", Some(2.0)))
        .collect();
    let draft = aggregate_components("Unit 5, Riverside Industrial Estate", &comps).unwrap();

    assert_eq!(
        draft.component_count as i64,
        draft.technologies.values().sum::<i64>()
    );
    assert_eq!(
        draft.component_count as i64,
        draft.companies.values().sum::<i64>()
    );
}

#[test]
fn is_active_iff_a_year_reaches_the_cutoff() {
    for (auction, expected) in [
        ("T-4 2024-25", true),
        ("T-1 2025-26", true),
        ("T-4 2023-24", false),
        ("T-4 2019-20", false),
    ] {
        let comps = vec![component(1, "RIV001", auction, None)];
        let mut draft = aggregate_components("loc", &comps).unwrap();
        draft.finish(2024);
        assert_eq!(draft.is_active, expected, "auction {auction}");
        assert_eq!(
            draft.is_active,
            years::is_active(&[auction.to_string()], 2024)
        );
    }
}

#[test]
fn aggregated_cmu_splits_capacity_otherwise_equal() {
    // aggregated: 10 locations, identical sums
    let comps = vec![component(1, "OCTO13", "T-4 2024-25", Some(10.0))];
    let mut draft = aggregate_components("loc", &comps).unwrap();
    let sums: Vec<(String, f64)> = (0..10).map(|i| (format!("loc {i}"), 10.0)).collect();
    apply_cmu_aggregation(&mut draft, 10, &sums);
    assert!(draft.is_aggregated_cmu);
    assert!((draft.normalized_capacity_mw - draft.displayed_capacity_mw / 10.0).abs() < 1e-9);
    assert_eq!(draft.capacity_confidence, CapacityConfidence::Medium);

    // not aggregated: normalized equals displayed
    let mut draft = aggregate_components("loc", &comps).unwrap();
    apply_cmu_aggregation(&mut draft, 1, &[]);
    assert!(!draft.is_aggregated_cmu);
    assert_eq!(draft.normalized_capacity_mw, draft.displayed_capacity_mw);
}

#[test]
fn geocoded_components_carry_uk_coordinates() {
    let comps: Vec<Component> = (0..3)
        .map(|i| component(i, "RIV001", "T-4 2024-25", None))
        .collect();
    for c in &comps {
        if c.geocoded {
            assert!(is_uk_coordinate(c.latitude.unwrap(), c.longitude.unwrap()));
        }
    }
    let draft = aggregate_components("loc", &comps).unwrap();
    assert!(is_uk_coordinate(
        draft.latitude.unwrap(),
        draft.longitude.unwrap()
    ));
}

#[test]
fn cmu_id_set_count_is_consistent_across_forms() {
    for n in [1usize, 20, 21, 100] {
        let ids: Vec<String> = (0..n).map(|i| format!("CMU{i:03}")).collect();
        let set = CmuIdSet::from_ids(ids);
        assert_eq!(set.count(), n as i64);
        assert!(set.visible_ids().len() <= n);
    }
}

#[tokio::test]
async fn dsr_subtypes_with_company_are_empty() {
    // the DSR-with-company branch answers before touching the store
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy("postgres://localhost/unused")
        .unwrap();
    let result = subtypes::subtypes("DSR", Some("Flexitricity Limited"), "future", &pool)
        .await
        .unwrap();
    assert!(result.is_empty());

    let result = subtypes::subtypes("DSR", None, "future", &pool).await.unwrap();
    assert_eq!(result, vec!["Octopus", "Axle", "Everything else"]);
}
