//! Heatmap API handlers

use axum::{
    extract::{ConnectInfo, Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

use super::handlers::{cached_heatmap_snapshot, check_rate, internal_error, AppState};
use crate::heatmap::HeatmapBatch;

#[derive(Serialize)]
pub struct RecordedResponse {
    pub recorded: usize,
}

/// Record one batch of spatial samples for a slug.
pub async fn record_heatmap_samples(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(batch): Json<HeatmapBatch>,
) -> Response {
    let rate_headers = match check_rate(
        &state,
        "heatmap_write",
        state.rate_limits.write_per_min,
        &headers,
        Some(addr),
    ) {
        Ok(headers) => headers,
        Err(rejection) => return rejection,
    };

    match state.heatmap.record_samples(&slug, &batch).await {
        Ok(recorded) => (rate_headers, Json(RecordedResponse { recorded })).into_response(),
        Err(err) => internal_error(err),
    }
}

/// Dense grid snapshot for one slug, grouped by bucket.
pub async fn get_heatmap_snapshot(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let rate_headers = match check_rate(
        &state,
        "heatmap_read",
        state.rate_limits.read_per_min,
        &headers,
        Some(addr),
    ) {
        Ok(headers) => headers,
        Err(rejection) => return rejection,
    };

    match cached_heatmap_snapshot(&state, slug).await {
        Ok(snapshot) => (rate_headers, Json(snapshot)).into_response(),
        Err(err) => internal_error(err),
    }
}

/// Per-slug totals across every recorded heatmap.
pub async fn list_heatmap_summaries(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let rate_headers = match check_rate(
        &state,
        "heatmap_read",
        state.rate_limits.read_per_min,
        &headers,
        Some(addr),
    ) {
        Ok(headers) => headers,
        Err(rejection) => return rejection,
    };

    match state.heatmap.list_summaries().await {
        Ok(summaries) => (rate_headers, Json(summaries)).into_response(),
        Err(err) => internal_error(err),
    }
}
