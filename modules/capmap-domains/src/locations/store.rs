//! Read operations over location_groups: filter/sort/paginate plus the
//! aggregate queries behind facets and totals.

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use capmap_common::geo::BoundingBox;

use crate::locations::model::{
    LocationGroup, LocationGroupSummary, ViewportRow, FULL_COLUMNS, SUMMARY_COLUMNS,
};
use crate::query_helpers::{latest_year_expr, push_cmu_containment, push_location_filters};

/// Hard cap on page size.
pub const MAX_PER_PAGE: i64 = 100;
/// Hard cap on rows loaded for a map viewport.
pub const MAX_VIEWPORT_ROWS: i64 = 10_000;

/// Text predicate variants produced by query classification.
#[derive(Debug, Clone, PartialEq)]
pub enum TextFilter {
    /// Rank against the search vector.
    FullText(String),
    /// AND every token across the text-ish columns.
    TokensAnd(Vec<String>),
    /// Exact CMU id containment.
    CmuExact(String),
    /// Substring over the stored CMU ids.
    CmuLike(String),
    /// Substring over company names.
    CompanyLike(String),
}

/// All request-time filters. Everything here becomes a SQL predicate.
#[derive(Debug, Clone, Default)]
pub struct LocationFilters {
    pub technology: Option<String>,
    pub company: Option<String>,
    pub auction_year: Option<String>,
    pub is_active: Option<bool>,
    pub outward_codes: Vec<String>,
    pub location_like: Option<String>,
    pub bbox: Option<BoundingBox>,
    pub text: Option<TextFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Relevance,
    Location,
    ComponentCount,
    Capacity,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Sort {
    pub key: SortKey,
    pub order: SortOrder,
}

impl Sort {
    pub fn capacity_desc() -> Self {
        Self {
            key: SortKey::Capacity,
            order: SortOrder::Desc,
        }
    }

    pub fn parse(sort_by: Option<&str>, sort_order: Option<&str>) -> Result<Self> {
        let key = match sort_by {
            None | Some("") | Some("relevance") => SortKey::Relevance,
            Some("location") => SortKey::Location,
            Some("components") | Some("component_count") => SortKey::ComponentCount,
            Some("capacity") => SortKey::Capacity,
            Some("date") => SortKey::Date,
            Some(other) => anyhow::bail!("unknown sort key: {other}"),
        };
        let order = match sort_order {
            None | Some("") | Some("desc") => SortOrder::Desc,
            Some("asc") => SortOrder::Asc,
            Some(other) => anyhow::bail!("unknown sort order: {other}"),
        };
        Ok(Self { key, order })
    }
}

/// One page of results with pagination bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

impl<T> Page<T> {
    pub fn empty(page: i64, per_page: i64) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            page,
            per_page,
            total_pages: 0,
        }
    }
}

/// Facet counts computed over the filtered result set, so the UI only
/// offers options that yield results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Facets {
    pub technologies: Vec<FacetCount>,
    pub companies: Vec<FacetCount>,
    pub auction_years: Vec<FacetCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FacetCount {
    pub value: String,
    pub count: i64,
}

/// Keyset pagination cursor: the previous page's last sort value and id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub value: CursorValue,
    pub id: i64,
}

// Int before Float: untagged deserialization tries variants in order, and
// an integer JSON number must stay an Int to round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CursorValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cursor {
    pub fn encode(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(raw)
            .context("invalid cursor encoding")?;
        serde_json::from_slice(&bytes).context("invalid cursor payload")
    }
}

fn clamp_paging(page: i64, per_page: i64) -> (i64, i64) {
    (page.max(1), per_page.clamp(1, MAX_PER_PAGE))
}

/// Append the ORDER BY for a sort. Ties always break by location then id
/// ascending so pagination is stable.
fn push_order_by(
    qb: &mut sqlx::QueryBuilder<'_, sqlx::Postgres>,
    sort: Sort,
    filters: &LocationFilters,
) {
    let dir = sort.order.sql();
    match sort.key {
        SortKey::Relevance => {
            if let Some(TextFilter::FullText(q)) = &filters.text {
                qb.push(
                    "ORDER BY ts_rank(lg.search_vector, websearch_to_tsquery('english', ",
                );
                qb.push_bind(q.clone());
                qb.push(")) DESC, lg.location ASC, lg.id ASC ");
            } else {
                // no text to rank against: fall back to capacity
                qb.push("ORDER BY lg.normalized_capacity_mw DESC, lg.location ASC, lg.id ASC ");
            }
        }
        SortKey::Location => {
            qb.push(format!("ORDER BY lg.location {dir}, lg.id ASC "));
        }
        SortKey::ComponentCount => {
            qb.push(format!(
                "ORDER BY lg.component_count {dir}, lg.location ASC, lg.id ASC "
            ));
        }
        SortKey::Capacity => {
            qb.push(format!(
                "ORDER BY lg.normalized_capacity_mw {dir}, lg.location ASC, lg.id ASC "
            ));
        }
        SortKey::Date => {
            qb.push(format!(
                "ORDER BY {} {dir} NULLS LAST, lg.location ASC, lg.id ASC ",
                latest_year_expr("lg")
            ));
        }
    }
}

pub async fn find_by_id(id: i64, pool: &PgPool) -> Result<Option<LocationGroup>> {
    let sql = format!("SELECT {FULL_COLUMNS} FROM location_groups lg WHERE lg.id = $1");
    sqlx::query_as::<_, LocationGroup>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
}

pub async fn find_by_location(location: &str, pool: &PgPool) -> Result<Option<LocationGroup>> {
    let sql = format!("SELECT {FULL_COLUMNS} FROM location_groups lg WHERE lg.location = $1");
    sqlx::query_as::<_, LocationGroup>(&sql)
        .bind(location)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
}

/// One page of compact rows. Totals and facets are separate queries so
/// callers can run the three concurrently.
pub async fn search(
    filters: &LocationFilters,
    sort: Sort,
    page: i64,
    per_page: i64,
    pool: &PgPool,
) -> Result<Vec<LocationGroupSummary>> {
    let (page, per_page) = clamp_paging(page, per_page);

    let mut qb = sqlx::QueryBuilder::new(format!(
        "SELECT {SUMMARY_COLUMNS} FROM location_groups lg WHERE 1=1 "
    ));
    push_location_filters(&mut qb, filters, "lg");
    push_order_by(&mut qb, sort, filters);
    qb.push("LIMIT ");
    qb.push_bind(per_page);
    qb.push(" OFFSET ");
    qb.push_bind((page - 1) * per_page);

    qb.build_query_as::<LocationGroupSummary>()
        .fetch_all(pool)
        .await
        .map_err(Into::into)
}

/// Whether any group contains this exact CMU id.
pub async fn cmu_exists(cmu_id: &str, pool: &PgPool) -> Result<bool> {
    let mut qb = sqlx::QueryBuilder::new("SELECT 1 FROM location_groups lg WHERE 1=1 ");
    push_cmu_containment(&mut qb, cmu_id, "lg");
    qb.push("LIMIT 1");
    let row: Option<(i32,)> = qb.build_query_as().fetch_optional(pool).await?;
    Ok(row.is_some())
}

/// Keyset-paginated search: O(per_page) at any depth. The cursor carries
/// the previous page's last (sort value, id) pair.
pub async fn search_after(
    filters: &LocationFilters,
    sort: Sort,
    cursor: Option<&Cursor>,
    per_page: i64,
    pool: &PgPool,
) -> Result<(Vec<LocationGroupSummary>, Option<Cursor>)> {
    let per_page = per_page.clamp(1, MAX_PER_PAGE);

    // keyset needs a concrete column; relevance and date degrade to capacity
    let key = match sort.key {
        SortKey::Location => SortKey::Location,
        SortKey::ComponentCount => SortKey::ComponentCount,
        _ => SortKey::Capacity,
    };
    let column = match key {
        SortKey::Location => "lg.location",
        SortKey::ComponentCount => "lg.component_count",
        _ => "lg.normalized_capacity_mw",
    };
    let dir = sort.order.sql();

    let mut qb = sqlx::QueryBuilder::new(format!(
        "SELECT {SUMMARY_COLUMNS} FROM location_groups lg WHERE 1=1 "
    ));
    push_location_filters(&mut qb, filters, "lg");

    if let Some(cursor) = cursor {
        let cmp = match sort.order {
            SortOrder::Asc => ">",
            SortOrder::Desc => "<",
        };
        qb.push(format!("AND ({column} {cmp} "));
        push_cursor_value(&mut qb, &cursor.value);
        qb.push(format!(" OR ({column} = "));
        push_cursor_value(&mut qb, &cursor.value);
        qb.push(" AND lg.id > ");
        qb.push_bind(cursor.id);
        qb.push(")) ");
    }

    qb.push(format!("ORDER BY {column} {dir}, lg.id ASC LIMIT "));
    qb.push_bind(per_page + 1);

    let mut items = qb
        .build_query_as::<LocationGroupSummary>()
        .fetch_all(pool)
        .await?;

    let has_more = items.len() as i64 > per_page;
    items.truncate(per_page as usize);

    let next = if has_more {
        items.last().map(|last| Cursor {
            value: match key {
                SortKey::Location => CursorValue::Text(last.location.clone()),
                SortKey::ComponentCount => CursorValue::Int(last.component_count as i64),
                _ => CursorValue::Float(last.normalized_capacity_mw),
            },
            id: last.id,
        })
    } else {
        None
    };

    Ok((items, next))
}

fn push_cursor_value(qb: &mut sqlx::QueryBuilder<'_, sqlx::Postgres>, value: &CursorValue) {
    match value {
        CursorValue::Float(v) => {
            qb.push_bind(*v);
        }
        CursorValue::Int(v) => {
            qb.push_bind(*v);
        }
        CursorValue::Text(v) => {
            qb.push_bind(v.clone());
        }
    }
}

/// Result-set totals: (distinct locations, sum of component counts).
pub async fn totals(filters: &LocationFilters, pool: &PgPool) -> Result<(i64, i64)> {
    let mut qb = sqlx::QueryBuilder::new(
        "SELECT COUNT(*), COALESCE(SUM(lg.component_count), 0)::bigint \
         FROM location_groups lg WHERE 1=1 ",
    );
    push_location_filters(&mut qb, filters, "lg");
    let (locations, components): (i64, i64) = qb.build_query_as().fetch_one(pool).await?;
    Ok((locations, components))
}

/// Facet maps over the filtered set, by jsonb aggregation. Counts are
/// location groups per value, never materialized rows.
pub async fn facets(filters: &LocationFilters, pool: &PgPool) -> Result<Facets> {
    let technologies = facet_over(
        "LATERAL jsonb_object_keys(lg.technologies) AS value",
        filters,
        pool,
    )
    .await?;
    let companies = facet_over(
        "LATERAL jsonb_object_keys(lg.companies) AS value",
        filters,
        pool,
    )
    .await?;
    let auction_years = facet_over(
        "LATERAL jsonb_array_elements_text(lg.auction_years) AS value",
        filters,
        pool,
    )
    .await?;

    Ok(Facets {
        technologies,
        companies,
        auction_years,
    })
}

async fn facet_over(
    lateral: &str,
    filters: &LocationFilters,
    pool: &PgPool,
) -> Result<Vec<FacetCount>> {
    let mut qb = sqlx::QueryBuilder::new(format!(
        "SELECT value, COUNT(*) AS count FROM location_groups lg, {lateral} WHERE 1=1 "
    ));
    push_location_filters(&mut qb, filters, "lg");
    qb.push("GROUP BY value ORDER BY count DESC, value ASC");
    qb.build_query_as::<FacetCount>()
        .fetch_all(pool)
        .await
        .map_err(Into::into)
}

/// Viewport query for the map: coordinate-bearing rows inside the bbox,
/// largest capacity first, hard-capped.
pub async fn in_viewport(
    bbox: &BoundingBox,
    filters: &LocationFilters,
    limit: i64,
    pool: &PgPool,
) -> Result<Vec<ViewportRow>> {
    let limit = limit.clamp(1, MAX_VIEWPORT_ROWS);
    let mut scoped = filters.clone();
    scoped.bbox = Some(*bbox);

    let mut qb = sqlx::QueryBuilder::new(
        "SELECT lg.id, lg.location, lg.latitude, lg.longitude, lg.technologies, \
         lg.companies, lg.descriptions, lg.component_count, lg.normalized_capacity_mw \
         FROM location_groups lg WHERE 1=1 ",
    );
    push_location_filters(&mut qb, &scoped, "lg");
    qb.push("ORDER BY lg.normalized_capacity_mw DESC, lg.id ASC LIMIT ");
    qb.push_bind(limit);

    qb.build_query_as::<ViewportRow>()
        .fetch_all(pool)
        .await
        .map_err(Into::into)
}

pub async fn count_in_viewport(
    bbox: &BoundingBox,
    filters: &LocationFilters,
    pool: &PgPool,
) -> Result<i64> {
    let mut scoped = filters.clone();
    scoped.bbox = Some(*bbox);
    let (count, _) = totals(&scoped, pool).await?;
    Ok(count)
}

/// Full rows for every group containing a CMU, filtered and sorted in SQL.
pub async fn by_cmu(
    cmu_id: &str,
    filters: &LocationFilters,
    sort: Sort,
    page: i64,
    per_page: i64,
    pool: &PgPool,
) -> Result<Page<LocationGroup>> {
    let (page, per_page) = clamp_paging(page, per_page);

    let mut qb = sqlx::QueryBuilder::new(format!(
        "SELECT {FULL_COLUMNS} FROM location_groups lg WHERE 1=1 "
    ));
    push_cmu_containment(&mut qb, cmu_id, "lg");
    push_location_filters(&mut qb, filters, "lg");
    push_order_by(&mut qb, sort, filters);
    qb.push("LIMIT ");
    qb.push_bind(per_page);
    qb.push(" OFFSET ");
    qb.push_bind((page - 1) * per_page);

    let items = qb.build_query_as::<LocationGroup>().fetch_all(pool).await?;

    let totals = cmu_totals(cmu_id, filters, pool).await?;
    let total = totals.total_locations;
    let total_pages = if total == 0 {
        0
    } else {
        (total + per_page - 1) / per_page
    };

    Ok(Page {
        items,
        total,
        page,
        per_page,
        total_pages,
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CmuTotals {
    pub total_locations: i64,
    pub total_capacity: f64,
    pub total_components: i64,
}

pub async fn cmu_totals(
    cmu_id: &str,
    filters: &LocationFilters,
    pool: &PgPool,
) -> Result<CmuTotals> {
    let mut qb = sqlx::QueryBuilder::new(
        "SELECT COUNT(*), COALESCE(SUM(lg.normalized_capacity_mw), 0), \
         COALESCE(SUM(lg.component_count), 0)::bigint \
         FROM location_groups lg WHERE 1=1 ",
    );
    push_cmu_containment(&mut qb, cmu_id, "lg");
    push_location_filters(&mut qb, filters, "lg");

    let (total_locations, total_capacity, total_components): (i64, f64, i64) =
        qb.build_query_as().fetch_one(pool).await?;

    Ok(CmuTotals {
        total_locations,
        total_capacity,
        total_components,
    })
}

/// Distinct technology/company/auction-year values across a CMU's groups,
/// for the detail page dropdowns.
pub async fn cmu_facet_values(
    cmu_id: &str,
    pool: &PgPool,
) -> Result<(Vec<String>, Vec<String>, Vec<String>)> {
    let technologies = cmu_distinct(
        cmu_id,
        "LATERAL jsonb_object_keys(lg.technologies) AS value",
        pool,
    )
    .await?;
    let companies = cmu_distinct(
        cmu_id,
        "LATERAL jsonb_object_keys(lg.companies) AS value",
        pool,
    )
    .await?;
    let auction_years = cmu_distinct(
        cmu_id,
        "LATERAL jsonb_array_elements_text(lg.auction_years) AS value",
        pool,
    )
    .await?;
    Ok((technologies, companies, auction_years))
}

async fn cmu_distinct(cmu_id: &str, lateral: &str, pool: &PgPool) -> Result<Vec<String>> {
    let mut qb = sqlx::QueryBuilder::new(format!(
        "SELECT DISTINCT value FROM location_groups lg, {lateral} WHERE 1=1 "
    ));
    push_cmu_containment(&mut qb, cmu_id, "lg");
    qb.push("ORDER BY value ASC");
    let rows: Vec<(String,)> = qb.build_query_as().fetch_all(pool).await?;
    Ok(rows.into_iter().map(|(v,)| v).collect())
}

/// How many location groups share a representative full postcode.
pub async fn colocated_count(full_postcode: &str, pool: &PgPool) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM location_groups lg \
         JOIN components c ON c.id = lg.representative_component_id \
         WHERE c.full_postcode = $1",
    )
    .bind(full_postcode)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips_all_value_kinds() {
        for value in [
            CursorValue::Float(42.5),
            CursorValue::Int(7),
            CursorValue::Text("Battersea".into()),
        ] {
            let cursor = Cursor { value, id: 99 };
            let decoded = Cursor::decode(&cursor.encode()).unwrap();
            assert_eq!(decoded, cursor);
        }
    }

    #[test]
    fn cursor_rejects_garbage() {
        assert!(Cursor::decode("not base64!!").is_err());
    }

    #[test]
    fn sort_parse_accepts_known_keys() {
        let sort = Sort::parse(Some("capacity"), Some("asc")).unwrap();
        assert_eq!(sort.key, SortKey::Capacity);
        assert_eq!(sort.order, SortOrder::Asc);

        let default = Sort::parse(None, None).unwrap();
        assert_eq!(default.key, SortKey::Relevance);
        assert_eq!(default.order, SortOrder::Desc);
    }

    #[test]
    fn sort_parse_rejects_unknown() {
        assert!(Sort::parse(Some("sneaky; DROP TABLE"), None).is_err());
        assert!(Sort::parse(Some("capacity"), Some("sideways")).is_err());
    }

    #[test]
    fn paging_is_clamped() {
        assert_eq!(clamp_paging(0, 500), (1, MAX_PER_PAGE));
        assert_eq!(clamp_paging(3, 0), (3, 1));
        assert_eq!(clamp_paging(2, 50), (2, 50));
    }
}
