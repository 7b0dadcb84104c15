use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use super::audit::list_metrics_audit;
use super::events::{flush_events, get_event_catalog, get_event_summary, ingest_events};
use super::handlers::{
    bump_view, get_metrics, health_check, overwrite_metrics, set_like_state, AppState,
};
use super::heatmap::{get_heatmap_snapshot, list_heatmap_summaries, record_heatmap_samples};

pub fn create_api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/metrics/{slug}",
            get(get_metrics).put(overwrite_metrics),
        )
        .route("/api/metrics/{slug}/view", post(bump_view))
        .route("/api/metrics/{slug}/like", post(set_like_state))
        .route("/api/heatmap", get(list_heatmap_summaries))
        .route(
            "/api/heatmap/{slug}",
            get(get_heatmap_snapshot).post(record_heatmap_samples),
        )
        .route("/api/events", post(ingest_events))
        .route("/api/events/flush", post(flush_events))
        .route("/api/events/summary", get(get_event_summary))
        .route("/api/events/catalog", get(get_event_catalog))
        .route("/api/audit", get(list_metrics_audit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
