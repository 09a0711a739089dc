//! Shared predicate builders for LocationGroup queries. Every request-time
//! filter is expressed here as SQL; result sets are never filtered in
//! program memory after the fetch.

use capmap_common::technology;

use crate::locations::store::{LocationFilters, TextFilter};

/// Append all set filters as `AND ...` clauses. `alias` is the SQL alias
/// of the location_groups table (e.g. "lg").
pub fn push_location_filters(
    qb: &mut sqlx::QueryBuilder<'_, sqlx::Postgres>,
    filters: &LocationFilters,
    alias: &str,
) {
    if let Some(active) = filters.is_active {
        qb.push(format!("AND {alias}.is_active = "));
        qb.push_bind(active);
        qb.push(" ");
    }

    if let Some(technology) = &filters.technology {
        // match any synonym the raw data may use for the requested name
        let names = technology::match_set(technology);
        qb.push(format!("AND {alias}.technologies ?| "));
        qb.push_bind(names);
        qb.push(" ");
    }

    if let Some(company) = &filters.company {
        qb.push(format!("AND {alias}.companies ? "));
        qb.push_bind(company.clone());
        qb.push(" ");
    }

    if let Some(auction_year) = &filters.auction_year {
        qb.push(format!("AND {alias}.auction_years ? "));
        qb.push_bind(auction_year.clone());
        qb.push(" ");
    }

    if !filters.outward_codes.is_empty() || filters.location_like.is_some() {
        qb.push("AND (");
        let mut needs_or = false;
        if !filters.outward_codes.is_empty() {
            qb.push(format!("{alias}.outward_code = ANY("));
            qb.push_bind(filters.outward_codes.clone());
            qb.push(")");
            needs_or = true;
        }
        if let Some(like) = &filters.location_like {
            if needs_or {
                qb.push(" OR ");
            }
            qb.push(format!("{alias}.location ILIKE "));
            qb.push_bind(format!("%{like}%"));
        }
        qb.push(") ");
    }

    if let Some(bbox) = &filters.bbox {
        qb.push(format!(
            "AND {alias}.latitude IS NOT NULL AND {alias}.longitude IS NOT NULL "
        ));
        qb.push(format!("AND {alias}.latitude BETWEEN "));
        qb.push_bind(bbox.south);
        qb.push(" AND ");
        qb.push_bind(bbox.north);
        qb.push(format!(" AND {alias}.longitude BETWEEN "));
        qb.push_bind(bbox.west);
        qb.push(" AND ");
        qb.push_bind(bbox.east);
        qb.push(" ");
    }

    if let Some(text) = &filters.text {
        push_text_filter(qb, text, alias);
    }
}

fn push_text_filter(
    qb: &mut sqlx::QueryBuilder<'_, sqlx::Postgres>,
    text: &TextFilter,
    alias: &str,
) {
    match text {
        TextFilter::FullText(q) => {
            qb.push(format!(
                "AND {alias}.search_vector @@ websearch_to_tsquery('english', "
            ));
            qb.push_bind(q.clone());
            qb.push(") ");
        }
        TextFilter::TokensAnd(tokens) => {
            for token in tokens {
                let like = format!("%{token}%");
                qb.push(format!("AND ({alias}.location ILIKE "));
                qb.push_bind(like.clone());
                qb.push(format!(" OR {alias}.descriptions::text ILIKE "));
                qb.push_bind(like.clone());
                qb.push(format!(" OR {alias}.companies::text ILIKE "));
                qb.push_bind(like.clone());
                qb.push(format!(" OR {alias}.technologies::text ILIKE "));
                qb.push_bind(like.clone());
                qb.push(format!(" OR {alias}.cmu_ids::text ILIKE "));
                qb.push_bind(like);
                qb.push(") ");
            }
        }
        TextFilter::CmuExact(cmu_id) => {
            push_cmu_containment(qb, cmu_id, alias);
        }
        TextFilter::CmuLike(q) => {
            qb.push(format!("AND {alias}.cmu_ids::text ILIKE "));
            qb.push_bind(format!("%{q}%"));
            qb.push(" ");
        }
        TextFilter::CompanyLike(q) => {
            qb.push(format!(
                "AND EXISTS (SELECT 1 FROM jsonb_object_keys({alias}.companies) AS k WHERE k ILIKE "
            ));
            qb.push_bind(format!("%{q}%"));
            qb.push(") ");
        }
    }
}

/// Containment over both stored shapes of `cmu_ids`: the small form is a
/// bare array, the large form keeps only `{count, sample}`.
pub fn push_cmu_containment(
    qb: &mut sqlx::QueryBuilder<'_, sqlx::Postgres>,
    cmu_id: &str,
    alias: &str,
) {
    qb.push(format!(
        "AND ((jsonb_typeof({alias}.cmu_ids) = 'array' AND {alias}.cmu_ids @> to_jsonb("
    ));
    qb.push_bind(cmu_id.to_string());
    qb.push("::text)) ");
    qb.push(format!(
        "OR (jsonb_typeof({alias}.cmu_ids) = 'object' AND {alias}.cmu_ids->'sample' @> to_jsonb("
    ));
    qb.push_bind(cmu_id.to_string());
    qb.push("::text))) ");
}

/// SQL expression for a group's latest auction year, for date sorting.
/// Computed in the store so the sort never materializes rows first.
pub fn latest_year_expr(alias: &str) -> String {
    format!(
        "(SELECT MAX(substring(y FROM '\\d{{4}}')::int) \
         FROM jsonb_array_elements_text({alias}.auction_years) AS y)"
    )
}
