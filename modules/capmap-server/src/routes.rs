use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use capmap_core::ServerDeps;

use crate::rest;

pub fn build_router(deps: Arc<ServerDeps>) -> Router {
    let deadline = Duration::from_secs(deps.config.request_deadline_secs);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/search/", get(rest::api_search))
        .route("/api/map-data/", get(rest::api_map_data))
        .route("/api/map-data/stream/", get(rest::api_map_stream))
        .route("/api/batch-map/", get(rest::api_batch_map))
        .route("/api/subtypes/", get(rest::api_subtypes))
        .route("/api/postcode/{postcode}/", get(rest::api_postcode))
        .route("/cmu/{cmu_id}/", get(rest::api_cmu_detail))
        .route("/location/{id}/", get(rest::api_location_detail))
        .route("/health", get(rest::health))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(deadline))
        .layer(cors)
        .with_state(deps)
}
