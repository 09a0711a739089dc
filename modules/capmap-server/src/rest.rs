//! REST handlers for the query surface.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use futures::StreamExt;
use serde::Deserialize;
use tracing::warn;

use capmap_common::geo::BoundingBox;
use capmap_core::ServerDeps;
use capmap_domains::cmu::{self, CmuDetailParams};
use capmap_domains::components::{self, Component};
use capmap_domains::locations::store as location_store;
use capmap_domains::map::{self, FeatureCollection, MapFilter, MapMetadata};
use capmap_domains::search::{self, SearchParams};
use capmap_domains::subtypes::{self, SubtypesResponse};

use crate::error::ApiError;

// --- Query structs ---

#[derive(Deserialize)]
pub struct SearchQuery {
    q: Option<String>,
    page: Option<i64>,
    per_page: Option<i64>,
    sort_by: Option<String>,
    sort_order: Option<String>,
    status: Option<String>,
    auction: Option<String>,
    technology: Option<String>,
    company: Option<String>,
    cursor: Option<String>,
}

#[derive(Deserialize)]
pub struct MapDataQuery {
    technology: Option<String>,
    company: Option<String>,
    north: Option<f64>,
    south: Option<f64>,
    east: Option<f64>,
    west: Option<f64>,
    show_active: Option<bool>,
    limit: Option<i64>,
    q: Option<String>,
}

#[derive(Deserialize)]
pub struct SubtypesQuery {
    category: Option<String>,
    company: Option<String>,
    period: Option<String>,
}

#[derive(Deserialize)]
pub struct CmuDetailQuery {
    page: Option<i64>,
    per_page: Option<i64>,
    sort_by: Option<String>,
    sort_order: Option<String>,
    status: Option<String>,
    auction: Option<String>,
}

#[derive(Deserialize)]
pub struct LocationDetailQuery {
    cmu_id: Option<String>,
    auction: Option<String>,
}

fn viewport(q: &MapDataQuery) -> BoundingBox {
    let uk = BoundingBox::uk();
    BoundingBox {
        north: q.north.unwrap_or(uk.north),
        south: q.south.unwrap_or(uk.south),
        east: q.east.unwrap_or(uk.east),
        west: q.west.unwrap_or(uk.west),
    }
}

// --- Handlers ---

pub async fn api_search(
    State(deps): State<Arc<ServerDeps>>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let params = SearchParams {
        q: query.q,
        technology: query.technology,
        company: query.company,
        auction_year: query.auction,
        status: query.status,
        sort_by: query.sort_by,
        sort_order: query.sort_order,
        page: query.page.unwrap_or(1),
        per_page: query.per_page.unwrap_or(25),
        cursor: query.cursor,
    };

    let result = search::search(&params, &deps).await?;
    Ok(Json(result))
}

pub async fn api_map_data(
    State(deps): State<Arc<ServerDeps>>,
    Query(query): Query<MapDataQuery>,
) -> impl IntoResponse {
    let bbox = viewport(&query);
    let filter = MapFilter {
        technology: query.technology.clone(),
        company: query.company.clone(),
        show_active: query.show_active,
        q: query.q.clone(),
    };
    let limit = query.limit.unwrap_or(1000);

    match map::geojson(&bbox, &filter, limit, deps.pool()).await {
        Ok(collection) => (StatusCode::OK, Json(collection)),
        Err(e) => {
            warn!(error = %e, "Map query failed");
            // map clients always get a valid, possibly empty, collection
            let collection = FeatureCollection {
                kind: "FeatureCollection".to_string(),
                features: Vec::new(),
                metadata: MapMetadata {
                    note: Some("store_error".to_string()),
                    ..Default::default()
                },
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(collection))
        }
    }
}

pub async fn api_map_stream(
    State(deps): State<Arc<ServerDeps>>,
    Query(query): Query<MapDataQuery>,
) -> impl IntoResponse {
    let bbox = viewport(&query);
    let filter = MapFilter {
        technology: query.technology.clone(),
        company: query.company.clone(),
        show_active: query.show_active,
        q: query.q.clone(),
    };

    let stream = map::stream_geojson(bbox, filter, deps.pool().clone()).map(|chunk| {
        chunk.map(axum::body::Bytes::from).map_err(|e| {
            warn!(error = %e, "Map stream aborted");
            std::io::Error::other(e.to_string())
        })
    });

    (
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        Body::from_stream(stream),
    )
}

pub async fn api_batch_map(
    State(deps): State<Arc<ServerDeps>>,
    RawQuery(raw): RawQuery,
) -> impl IntoResponse {
    let raw = raw.unwrap_or_default();
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect();

    let technologies: Vec<String> = pairs
        .iter()
        .filter(|(k, _)| k == "tech[]" || k == "tech")
        .flat_map(|(_, v)| v.split(',').map(str::trim).map(String::from))
        .filter(|v| !v.is_empty())
        .collect();

    if technologies.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "No technologies specified" })),
        );
    }

    let get = |key: &str| -> Option<String> {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };

    let uk = BoundingBox::uk();
    let bbox = BoundingBox {
        north: get("north").and_then(|v| v.parse().ok()).unwrap_or(uk.north),
        south: get("south").and_then(|v| v.parse().ok()).unwrap_or(uk.south),
        east: get("east").and_then(|v| v.parse().ok()).unwrap_or(uk.east),
        west: get("west").and_then(|v| v.parse().ok()).unwrap_or(uk.west),
    };
    let filter = MapFilter {
        technology: None,
        company: get("company"),
        show_active: get("show_active").and_then(|v| v.parse().ok()),
        q: get("q"),
    };
    let limit = get("limit").and_then(|v| v.parse().ok()).unwrap_or(1000);

    match map::batch(&bbox, &technologies, &filter, limit, &deps).await {
        Ok(result) => match serde_json::to_value(&result) {
            Ok(value) => (StatusCode::OK, Json(value)),
            Err(e) => {
                warn!(error = %e, "Batch map serialization failed");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({ "error": "service temporarily unavailable" })),
                )
            }
        },
        Err(e) => {
            warn!(error = %e, "Batch map failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "service temporarily unavailable" })),
            )
        }
    }
}

pub async fn api_subtypes(
    State(deps): State<Arc<ServerDeps>>,
    Query(query): Query<SubtypesQuery>,
) -> impl IntoResponse {
    let category = query.category.unwrap_or_default();
    let company = query.company.unwrap_or_default();
    let period = query.period.unwrap_or_else(|| "future".to_string());

    let company_opt = if company.trim().is_empty() {
        None
    } else {
        Some(company.trim())
    };

    match subtypes::subtypes(&category, company_opt, &period, deps.pool()).await {
        Ok(values) => {
            let response = SubtypesResponse {
                count: values.len(),
                subtypes: values,
                category,
                company,
                period,
            };
            (StatusCode::OK, Json(serde_json::json!(response)))
        }
        Err(e) => {
            warn!(error = %e, "Subtypes query failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "subtypes": [],
                    "category": category,
                    "company": company,
                    "period": period,
                    "count": 0,
                    "error": "service temporarily unavailable",
                })),
            )
        }
    }
}

pub async fn api_cmu_detail(
    State(deps): State<Arc<ServerDeps>>,
    Path(cmu_id): Path<String>,
    Query(query): Query<CmuDetailQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let params = CmuDetailParams {
        page: query.page.unwrap_or(1),
        per_page: query.per_page.unwrap_or(50),
        sort_by: query.sort_by,
        sort_order: query.sort_order,
        status: query.status,
        auction: query.auction,
    };

    let detail = cmu::detail(&cmu_id, &params, deps.pool()).await?;
    Ok(Json(detail))
}

pub async fn api_location_detail(
    State(deps): State<Arc<ServerDeps>>,
    Path(id): Path<i64>,
    Query(query): Query<LocationDetailQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let group = location_store::find_by_id(id, deps.pool())
        .await
        .map_err(|e| capmap_common::CapMapError::Store(e.to_string()))?;

    let Some(group) = group else {
        return Ok(Json(serde_json::json!({ "found": false })));
    };

    let components = Component::for_location_detail(
        &group.location,
        query.cmu_id.as_deref(),
        query.auction.as_deref(),
        deps.pool(),
    )
    .await
    .map_err(|e| capmap_common::CapMapError::Store(e.to_string()))?;

    // colocation and business context come from the representative component
    let mut colocation: Option<serde_json::Value> = None;
    let mut business_name: Option<String> = None;
    if let Some(rep_id) = group.representative_component_id {
        if let Some(rep) = Component::find_by_id(rep_id, deps.pool())
            .await
            .map_err(|e| capmap_common::CapMapError::Store(e.to_string()))?
        {
            if let Some(postcode) = &rep.full_postcode {
                let count = location_store::colocated_count(postcode, deps.pool())
                    .await
                    .map_err(|e| capmap_common::CapMapError::Store(e.to_string()))?;
                if count > 1 {
                    colocation = Some(serde_json::json!({
                        "postcode": postcode,
                        "count": count,
                    }));
                }
            }
            // only surfaced when a major retailer was identified at the site
            if !rep.places_api_major_retailers.is_empty() {
                business_name = rep.places_api_business_name.clone();
            }
        }
    }

    let organized = components::organize_for_detail(components);
    let primary_technology = group.primary_technology().to_string();
    let display_capacity = group.display_capacity();

    Ok(Json(serde_json::json!({
        "found": true,
        "location_group": group,
        "primary_technology": primary_technology,
        "display_capacity": display_capacity,
        "components": organized,
        "colocation": colocation,
        "business_name": business_name,
    })))
}

#[derive(Deserialize)]
pub struct PostcodeQuery {
    nearest: Option<bool>,
    radius: Option<u32>,
    limit: Option<u32>,
}

/// Postcode lookup: area from the static index, validity and neighbours
/// from the external provider (cached, best-effort).
pub async fn api_postcode(
    State(deps): State<Arc<ServerDeps>>,
    Path(postcode): Path<String>,
    Query(query): Query<PostcodeQuery>,
) -> impl IntoResponse {
    let area = deps.postcodes.area_for_postcode(&postcode).map(String::from);
    let valid = deps.postcode_client.validate(&postcode).await;

    let nearest = if query.nearest.unwrap_or(false) && valid {
        deps.postcode_client
            .nearest(
                &postcode,
                query.radius.unwrap_or(1000),
                query.limit.unwrap_or(5).min(20),
            )
            .await
    } else {
        Vec::new()
    };

    let outcode = capmap_core::postcodes::outward_token(&postcode);
    let outcode_details = deps.postcode_client.outcode_details(&outcode).await;

    Json(serde_json::json!({
        "postcode": postcode,
        "outcode": outcode,
        "valid": valid,
        "area": area,
        "nearest": nearest,
        "outcode_details": outcode_details,
    }))
}

pub async fn health() -> &'static str {
    "ok"
}
