//! Map service: viewport queries rendered as GeoJSON, a batched variant
//! for several technologies in one round trip, and a streaming path for
//! very large result sets.

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::Result;
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use capmap_common::geo::BoundingBox;
use capmap_common::technology;
use capmap_core::cache::ttl;
use capmap_core::ServerDeps;

use crate::locations::store::{self, TextFilter, MAX_VIEWPORT_ROWS};
use crate::locations::{LocationFilters, ViewportRow};
use crate::query_helpers::push_location_filters;

/// Streamed responses flush roughly this many bytes per chunk.
const STREAM_CHUNK_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Default)]
pub struct MapFilter {
    pub technology: Option<String>,
    pub company: Option<String>,
    pub show_active: Option<bool>,
    pub q: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: String,
    pub features: Vec<Feature>,
    pub metadata: MapMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: String,
    pub geometry: Geometry,
    pub properties: FeatureProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: String,
    /// GeoJSON order: [longitude, latitude].
    pub coordinates: [f64; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureProperties {
    pub id: i64,
    pub title: String,
    pub technology: String,
    pub display_technology: String,
    pub company: Option<String>,
    pub company_count: i64,
    pub component_count: i32,
    pub capacity_mw: f64,
    pub description: String,
    pub detail_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapMetadata {
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technology: Option<String>,
    pub total_capacity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub results: BTreeMap<String, FeatureCollection>,
    pub metadata: BatchMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub total_technologies: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub elapsed_ms: u64,
}

fn location_filters(filter: &MapFilter) -> LocationFilters {
    let text = filter.q.as_deref().and_then(|q| {
        let trimmed = q.trim();
        if trimmed.is_empty() {
            return None;
        }
        let upper = trimmed.to_uppercase();
        if upper.starts_with("CMU") || upper.starts_with("BMU") || upper.starts_with("DSR") {
            Some(TextFilter::CmuLike(upper))
        } else {
            Some(TextFilter::TokensAnd(
                trimmed.split_whitespace().map(String::from).collect(),
            ))
        }
    });

    LocationFilters {
        technology: filter.technology.clone(),
        company: filter.company.clone(),
        is_active: Some(filter.show_active.unwrap_or(true)),
        text,
        ..Default::default()
    }
}

fn feature_from_row(row: &ViewportRow, requested_tech: Option<&str>) -> Feature {
    let primary = technology::primary_technology(&row.technologies)
        .unwrap_or("Unknown")
        .to_string();
    let display = technology::display_technology(&row.technologies, requested_tech);

    let company = row
        .companies
        .iter()
        .max_by(|(a_name, a_count), (b_name, b_count)| {
            a_count.cmp(b_count).then(b_name.cmp(a_name))
        })
        .map(|(name, _)| name.clone());

    Feature {
        kind: "Feature".to_string(),
        geometry: Geometry {
            kind: "Point".to_string(),
            coordinates: [row.longitude, row.latitude],
        },
        properties: FeatureProperties {
            id: row.id,
            title: row.location.clone(),
            technology: primary,
            display_technology: display,
            company,
            company_count: row.companies.len() as i64,
            component_count: row.component_count,
            capacity_mw: row.normalized_capacity_mw,
            description: row.descriptions.first().cloned().unwrap_or_default(),
            detail_url: format!("/location/{}/", row.id),
        },
    }
}

fn out_of_range_collection(technology: Option<String>) -> FeatureCollection {
    FeatureCollection {
        kind: "FeatureCollection".to_string(),
        features: Vec::new(),
        metadata: MapMetadata {
            count: 0,
            technology,
            total_capacity: 0.0,
            note: Some("out_of_range".to_string()),
            ..Default::default()
        },
    }
}

/// Features for one viewport and filter. Always a valid FeatureCollection,
/// hard-capped with a `truncated` marker when the viewport holds more.
pub async fn geojson(
    bbox: &BoundingBox,
    filter: &MapFilter,
    limit: i64,
    pool: &PgPool,
) -> Result<FeatureCollection> {
    if !bbox.intersects_uk() {
        return Ok(out_of_range_collection(filter.technology.clone()));
    }

    let filters = location_filters(filter);
    let limit = limit.clamp(1, MAX_VIEWPORT_ROWS);
    let rows = store::in_viewport(bbox, &filters, limit, pool).await?;

    let requested = filter.technology.as_deref();
    let features: Vec<Feature> = rows.iter().map(|r| feature_from_row(r, requested)).collect();
    let total_capacity: f64 = features.iter().map(|f| f.properties.capacity_mw).sum();

    // only pay for the count query when the page came back full
    let (truncated, total) = if rows.len() as i64 >= limit {
        let total = store::count_in_viewport(bbox, &filters, pool).await?;
        (Some(total > limit), Some(total))
    } else {
        (None, None)
    };

    Ok(FeatureCollection {
        kind: "FeatureCollection".to_string(),
        metadata: MapMetadata {
            count: features.len(),
            technology: filter.technology.clone(),
            total_capacity,
            truncated,
            total,
            note: None,
        },
        features,
    })
}

/// Several technologies in one call, each checked against the map cache.
pub async fn batch(
    bbox: &BoundingBox,
    technologies: &[String],
    filter: &MapFilter,
    limit_per_tech: i64,
    deps: &ServerDeps,
) -> Result<BatchResult> {
    let start = Instant::now();
    let mut results = BTreeMap::new();
    let mut metadata = BatchMetadata {
        total_technologies: technologies.len(),
        ..Default::default()
    };

    for tech in technologies {
        let key = deps.cache.map_key(&[
            ("technology", tech.clone()),
            ("query", filter.q.clone().unwrap_or_default()),
            ("show_active", filter.show_active.unwrap_or(true).to_string()),
            ("limit", limit_per_tech.to_string()),
            ("north", bbox.north.to_string()),
            ("south", bbox.south.to_string()),
            ("east", bbox.east.to_string()),
            ("west", bbox.west.to_string()),
        ]);

        if let Some(collection) = deps.cache.get::<FeatureCollection>(&key).await {
            metadata.cache_hits += 1;
            results.insert(tech.clone(), collection);
            continue;
        }

        let scoped = MapFilter {
            technology: Some(tech.clone()),
            ..filter.clone()
        };
        let collection = geojson(bbox, &scoped, limit_per_tech, deps.pool()).await?;
        deps.cache.set(&key, &collection, ttl::MAP).await;
        metadata.cache_misses += 1;
        results.insert(tech.clone(), collection);
    }

    metadata.elapsed_ms = start.elapsed().as_millis() as u64;
    Ok(BatchResult { results, metadata })
}

/// Stream a FeatureCollection as the store iterates, for result sets too
/// large to buffer. The envelope frames fixed-size feature chunks.
pub fn stream_geojson(
    bbox: BoundingBox,
    filter: MapFilter,
    pool: PgPool,
) -> impl Stream<Item = Result<String>> {
    async_stream::try_stream! {
        if !bbox.intersects_uk() {
            let collection = out_of_range_collection(filter.technology.clone());
            yield serde_json::to_string(&collection)?;
            return;
        }

        yield "{\"type\":\"FeatureCollection\",\"features\":[".to_string();

        let mut filters = location_filters(&filter);
        filters.bbox = Some(bbox);

        let mut qb = sqlx::QueryBuilder::new(
            "SELECT lg.id, lg.location, lg.latitude, lg.longitude, lg.technologies, \
             lg.companies, lg.descriptions, lg.component_count, lg.normalized_capacity_mw \
             FROM location_groups lg WHERE 1=1 ",
        );
        push_location_filters(&mut qb, &filters, "lg");
        qb.push("ORDER BY lg.normalized_capacity_mw DESC, lg.id ASC LIMIT ");
        qb.push_bind(MAX_VIEWPORT_ROWS);

        let mut rows = qb.build_query_as::<ViewportRow>().fetch(&pool);
        let requested = filter.technology.clone();

        let mut buf = String::new();
        let mut first = true;
        while let Some(row) = rows.try_next().await? {
            let feature = feature_from_row(&row, requested.as_deref());
            if !first {
                buf.push(',');
            }
            first = false;
            buf.push_str(&serde_json::to_string(&feature)?);
            if buf.len() >= STREAM_CHUNK_BYTES {
                yield std::mem::take(&mut buf);
            }
        }
        if !buf.is_empty() {
            yield buf;
        }

        yield "],\"metadata\":{\"streaming\":true}}".to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::types::Json;

    fn row(techs: &[(&str, i64)]) -> ViewportRow {
        ViewportRow {
            id: 42,
            location: "Battersea Power Station, SW11".into(),
            latitude: 51.48,
            longitude: -0.14,
            technologies: Json(techs.iter().map(|(k, v)| (k.to_string(), *v)).collect()),
            companies: Json(
                [("ACME ENERGY LIMITED".to_string(), 2i64), ("ZENITH".to_string(), 1)]
                    .into_iter()
                    .collect(),
            ),
            descriptions: Json(vec!["Battery unit 1".into(), "Battery unit 2".into()]),
            component_count: 3,
            normalized_capacity_mw: 49.5,
        }
    }

    #[test]
    fn feature_coordinates_are_lon_lat() {
        let feature = feature_from_row(&row(&[("Battery", 3)]), None);
        assert_eq!(feature.geometry.coordinates, [-0.14, 51.48]);
        assert_eq!(feature.kind, "Feature");
        assert_eq!(feature.geometry.kind, "Point");
    }

    #[test]
    fn priority_beats_count_in_properties() {
        let feature = feature_from_row(&row(&[("DSR", 3), ("Battery", 1)]), None);
        assert_eq!(feature.properties.technology, "Battery");
    }

    #[test]
    fn requested_synonym_displays_canonical() {
        let feature = feature_from_row(&row(&[("Gas reciprocating engines", 2)]), Some("OCGT"));
        assert_eq!(feature.properties.display_technology, "OCGT");
    }

    #[test]
    fn feature_carries_primary_company_and_description() {
        let feature = feature_from_row(&row(&[("Battery", 3)]), None);
        assert_eq!(feature.properties.company.as_deref(), Some("ACME ENERGY LIMITED"));
        assert_eq!(feature.properties.description, "Battery unit 1");
        assert_eq!(feature.properties.detail_url, "/location/42/");
    }

    #[test]
    fn out_of_range_viewport_notes_and_is_empty() {
        let collection = out_of_range_collection(Some("Battery".into()));
        assert!(collection.features.is_empty());
        assert_eq!(collection.metadata.note.as_deref(), Some("out_of_range"));
        assert_eq!(collection.metadata.count, 0);
    }

    #[test]
    fn cmu_prefixed_map_query_searches_ids() {
        let filter = MapFilter {
            q: Some("dsr123".into()),
            ..Default::default()
        };
        let filters = location_filters(&filter);
        assert_eq!(filters.text, Some(TextFilter::CmuLike("DSR123".into())));
    }
}
