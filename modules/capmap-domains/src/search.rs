//! Search service: classifies the query, composes store filters, and
//! returns paginated groups plus facet counts.

use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use capmap_common::technology::{COMPANY_QUERY_TOKENS, TECH_QUERY_TOKENS};
use capmap_common::CapMapError;
use capmap_core::cache::ttl;
use capmap_core::postcodes::outward_code_re;
use capmap_core::ServerDeps;

use crate::locations::store::{self, Cursor, Facets, Sort, TextFilter};
use crate::locations::{LocationFilters, LocationGroupSummary};

#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    pub q: Option<String>,
    pub technology: Option<String>,
    pub company: Option<String>,
    pub auction_year: Option<String>,
    pub status: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub page: i64,
    pub per_page: i64,
    pub cursor: Option<String>,
}

/// Query shape, decided before touching the store. First match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Empty,
    Postcode,
    CmuId,
    Technology,
    Company,
    MultiWord,
    FullText,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Empty => "empty",
            QueryKind::Postcode => "postcode",
            QueryKind::CmuId => "cmu_id",
            QueryKind::Technology => "technology",
            QueryKind::Company => "company",
            QueryKind::MultiWord => "multi_word",
            QueryKind::FullText => "full_text",
        }
    }
}

/// Classify a raw query string. Order matters: postcode beats CMU shape,
/// CMU shape beats technology tokens.
pub fn classify_query(q: &str) -> QueryKind {
    let trimmed = q.trim();
    if trimmed.is_empty() {
        return QueryKind::Empty;
    }

    let upper = trimmed.to_uppercase();
    if outward_code_re().is_match(&upper) {
        return QueryKind::Postcode;
    }

    if trimmed == upper
        && (3..=15).contains(&trimmed.len())
        && trimmed.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return QueryKind::CmuId;
    }

    let lower = trimmed.to_lowercase();
    if TECH_QUERY_TOKENS.contains(&lower.as_str()) {
        return QueryKind::Technology;
    }

    if lower
        .split_whitespace()
        .any(|token| COMPANY_QUERY_TOKENS.contains(&token))
    {
        return QueryKind::Company;
    }

    if trimmed.split_whitespace().count() > 1 {
        return QueryKind::MultiWord;
    }

    QueryKind::FullText
}

/// Canonical technology name for a lowercase query token.
fn canonical_tech(token: &str) -> String {
    match token {
        "battery" => "Battery".to_string(),
        "wind" => "Wind".to_string(),
        "solar" => "Solar".to_string(),
        "gas" => "Gas".to_string(),
        "dsr" => "DSR".to_string(),
        "chp" => "CHP".to_string(),
        "hydro" => "Hydro".to_string(),
        "nuclear" => "Nuclear".to_string(),
        "coal" => "Coal".to_string(),
        "biomass" => "Biomass".to_string(),
        other => other.to_string(),
    }
}

pub fn parse_status(status: Option<&str>) -> Option<bool> {
    match status {
        Some("active") | Some("future") => Some(true),
        Some("inactive") | Some("historical") => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub groups: Vec<LocationGroupSummary>,
    pub total_locations: i64,
    pub total_components: i64,
    pub facets: Facets,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
    pub query_kind: String,
    pub from_cache: bool,
    pub took_ms: u64,
    pub next_cursor: Option<String>,
    pub error: Option<String>,
}

impl SearchResult {
    fn degraded(params: &SearchParams, kind: QueryKind, error: String) -> Self {
        Self {
            groups: Vec::new(),
            total_locations: 0,
            total_components: 0,
            facets: Facets::default(),
            page: params.page.max(1),
            per_page: params.per_page,
            total_pages: 0,
            query_kind: kind.as_str().to_string(),
            from_cache: false,
            took_ms: 0,
            next_cursor: None,
            error: Some(error),
        }
    }
}

/// Run a search. `Err` is returned only for invalid input; store failures
/// degrade to an empty result with `error` populated.
pub async fn search(params: &SearchParams, deps: &ServerDeps) -> Result<SearchResult, CapMapError> {
    let start = Instant::now();
    let pool = deps.pool();

    let sort = Sort::parse(params.sort_by.as_deref(), params.sort_order.as_deref())
        .map_err(|e| CapMapError::InvalidInput(e.to_string()))?;

    let q = params.q.as_deref().unwrap_or("").trim().to_string();
    let kind = classify_query(&q);

    // CMU-shaped queries only stay CMU searches when the id really exists;
    // otherwise fall through to a substring match over stored ids.
    let mut filters = LocationFilters {
        technology: params.technology.clone(),
        company: params.company.clone(),
        auction_year: params.auction_year.clone(),
        is_active: parse_status(params.status.as_deref()),
        ..Default::default()
    };

    match kind {
        QueryKind::Empty => {}
        QueryKind::Postcode => {
            filters.outward_codes = deps.postcodes.postcodes_for_area(&q);
            filters.location_like = Some(q.clone());
        }
        QueryKind::CmuId => {
            let exact = store::cmu_exists(&q, pool).await.unwrap_or(false);
            filters.text = Some(if exact {
                TextFilter::CmuExact(q.clone())
            } else {
                TextFilter::CmuLike(q.clone())
            });
        }
        QueryKind::Technology => {
            filters.technology = Some(canonical_tech(&q.to_lowercase()));
        }
        QueryKind::Company => {
            filters.text = Some(TextFilter::CompanyLike(q.clone()));
        }
        QueryKind::MultiWord => {
            let tokens: Vec<String> = q.split_whitespace().map(String::from).collect();
            filters.text = Some(TextFilter::TokensAnd(tokens));
        }
        QueryKind::FullText => {
            filters.text = Some(TextFilter::FullText(q.clone()));
        }
    }

    // text queries rank by relevance; plain listings by capacity
    let sort = if params.sort_by.is_none() && filters.text.is_none() && kind != QueryKind::Postcode
    {
        Sort::capacity_desc()
    } else {
        sort
    };

    // cursor mode: keyset pagination, no window caching
    if let Some(raw_cursor) = &params.cursor {
        let cursor =
            Cursor::decode(raw_cursor).map_err(|e| CapMapError::InvalidInput(e.to_string()))?;
        return match cursor_search(&filters, sort, &cursor, params, kind, pool).await {
            Ok(mut result) => {
                result.took_ms = start.elapsed().as_millis() as u64;
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cursor search failed, returning degraded result");
                Ok(SearchResult::degraded(params, kind, "store unavailable".to_string()))
            }
        };
    }

    // plain queries read through the window cache at any page
    let plain = plain_query(params);
    if plain {
        let key = deps.cache.search_page_key(&q, params.page.max(1));
        if let Some(mut cached) = deps.cache.get::<SearchResult>(&key).await {
            cached.from_cache = true;
            cached.took_ms = start.elapsed().as_millis() as u64;
            return Ok(cached);
        }
    }

    let rows = store::search(&filters, sort, params.page, params.per_page, pool);
    let totals = store::totals(&filters, pool);
    let facets = store::facets(&filters, pool);

    let (rows, totals, facets) = match tokio::try_join!(rows, totals, facets) {
        Ok(results) => results,
        Err(e) => {
            tracing::warn!(error = %e, "Search store query failed, returning degraded result");
            return Ok(SearchResult::degraded(params, kind, "store unavailable".to_string()));
        }
    };

    let (total_locations, total_components) = totals;
    let per_page = params.per_page.clamp(1, store::MAX_PER_PAGE);
    let total_pages = if total_locations == 0 {
        0
    } else {
        (total_locations + per_page - 1) / per_page
    };

    let result = SearchResult {
        groups: rows,
        total_locations,
        total_components,
        facets,
        page: params.page.max(1),
        per_page,
        total_pages,
        query_kind: kind.as_str().to_string(),
        from_cache: false,
        took_ms: start.elapsed().as_millis() as u64,
        next_cursor: None,
        error: None,
    };

    // window strategy: only the first, last, and quartile pages are worth
    // keeping, since most users never leave the first two
    if plain && is_window_page(result.page, result.total_pages) {
        let key = deps.cache.search_page_key(&q, result.page);
        deps.cache.set(&key, &result, ttl::SEARCH).await;
        deps.cache
            .set(
                &deps.cache.search_pagination_key(&q),
                &(result.total_locations, result.total_pages),
                ttl::SEARCH,
            )
            .await;
    }

    Ok(result)
}

async fn cursor_search(
    filters: &LocationFilters,
    sort: Sort,
    cursor: &Cursor,
    params: &SearchParams,
    kind: QueryKind,
    pool: &sqlx::PgPool,
) -> Result<SearchResult> {
    let (rows, totals, facets) = tokio::try_join!(
        store::search_after(filters, sort, Some(cursor), params.per_page, pool),
        store::totals(filters, pool),
        store::facets(filters, pool),
    )?;

    let (groups, next) = rows;
    let (total_locations, total_components) = totals;
    let per_page = params.per_page.clamp(1, store::MAX_PER_PAGE);
    let total_pages = if total_locations == 0 {
        0
    } else {
        (total_locations + per_page - 1) / per_page
    };

    Ok(SearchResult {
        groups,
        total_locations,
        total_components,
        facets,
        page: 0,
        per_page,
        total_pages,
        query_kind: kind.as_str().to_string(),
        from_cache: false,
        took_ms: 0,
        next_cursor: next.map(|c| c.encode()),
        error: None,
    })
}

/// Only filter-free, default-sort queries touch the window cache;
/// anything else goes straight to the store.
fn plain_query(params: &SearchParams) -> bool {
    params.technology.is_none()
        && params.company.is_none()
        && params.auction_year.is_none()
        && params.status.is_none()
        && params.sort_by.is_none()
        && params.cursor.is_none()
}

/// Window pages: first, last, and the quartile marks.
fn is_window_page(page: i64, total_pages: i64) -> bool {
    if page == 1 {
        return true;
    }
    if total_pages < 2 {
        return false;
    }
    let quartiles = [
        (total_pages / 4).max(1),
        (total_pages / 2).max(1),
        (total_pages * 3 / 4).max(1),
        total_pages,
    ];
    quartiles.contains(&page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_order_first_match_wins() {
        assert_eq!(classify_query(""), QueryKind::Empty);
        assert_eq!(classify_query("   "), QueryKind::Empty);
        assert_eq!(classify_query("SW11"), QueryKind::Postcode);
        assert_eq!(classify_query("ng1"), QueryKind::Postcode);
        assert_eq!(classify_query("EC1A"), QueryKind::Postcode);
        assert_eq!(classify_query("OCTO13"), QueryKind::CmuId);
        assert_eq!(classify_query("VIT-304"), QueryKind::CmuId);
        assert_eq!(classify_query("battery"), QueryKind::Technology);
        assert_eq!(classify_query("Octopus Energy"), QueryKind::Company);
        assert_eq!(classify_query("Flexitricity Limited"), QueryKind::Company);
        assert_eq!(classify_query("engine farm leeds"), QueryKind::MultiWord);
        assert_eq!(classify_query("battersea"), QueryKind::FullText);
    }

    #[test]
    fn postcode_shape_beats_cmu_shape() {
        // SW11 is both outward syntax and CMU-shaped; postcode wins
        assert_eq!(classify_query("SW11"), QueryKind::Postcode);
    }

    #[test]
    fn lowercase_strings_are_never_cmu_ids() {
        assert_eq!(classify_query("octo13"), QueryKind::FullText);
    }

    #[test]
    fn tech_token_beats_full_text() {
        assert_eq!(classify_query("Solar"), QueryKind::Technology);
        assert_eq!(classify_query("dsr"), QueryKind::Technology);
    }

    #[test]
    fn status_parses_both_vocabularies() {
        assert_eq!(parse_status(Some("active")), Some(true));
        assert_eq!(parse_status(Some("future")), Some(true));
        assert_eq!(parse_status(Some("inactive")), Some(false));
        assert_eq!(parse_status(Some("historical")), Some(false));
        assert_eq!(parse_status(Some("all")), None);
        assert_eq!(parse_status(None), None);
    }

    #[test]
    fn canonical_tech_maps_tokens() {
        assert_eq!(canonical_tech("battery"), "Battery");
        assert_eq!(canonical_tech("chp"), "CHP");
        assert_eq!(canonical_tech("dsr"), "DSR");
    }

    #[test]
    fn window_pages_are_first_last_and_quartiles() {
        assert!(is_window_page(1, 0));
        assert!(is_window_page(1, 100));
        assert!(is_window_page(25, 100));
        assert!(is_window_page(50, 100));
        assert!(is_window_page(75, 100));
        assert!(is_window_page(100, 100));
        assert!(!is_window_page(2, 100));
        assert!(!is_window_page(99, 100));
        // tiny result sets only keep the first page
        assert!(!is_window_page(2, 1));
    }
}
