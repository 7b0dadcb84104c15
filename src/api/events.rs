//! Events API handlers

use axum::{
    extract::{ConnectInfo, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use super::handlers::{check_rate, internal_error, AppState};
use crate::events::{IncomingEvent, RequestContext, SummaryQuery};
use crate::ratelimit;

#[derive(Serialize)]
pub struct IngestedResponse {
    pub ingested: usize,
}

#[derive(Deserialize)]
pub struct FlushParams {
    pub limit: Option<usize>,
}

/// Ingest a client batch. Unknown names and malformed rows are dropped
/// silently; the response reports how many rows were accepted.
pub async fn ingest_events(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(events): Json<Vec<IncomingEvent>>,
) -> Response {
    let rate_headers = match check_rate(
        &state,
        "events_write",
        state.rate_limits.write_per_min,
        &headers,
        Some(addr),
    ) {
        Ok(headers) => headers,
        Err(rejection) => return rejection,
    };

    let context = request_context(&headers, addr);

    match state.events.ingest(events, &context).await {
        Ok(ingested) => (rate_headers, Json(IngestedResponse { ingested })).into_response(),
        Err(err) => internal_error(err),
    }
}

/// Drain queued events into the durable rollups. Invoked by an external
/// scheduler, not by page traffic.
pub async fn flush_events(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<FlushParams>,
) -> Response {
    let rate_headers = match check_rate(
        &state,
        "events_admin",
        state.rate_limits.admin_per_min,
        &headers,
        Some(addr),
    ) {
        Ok(headers) => headers,
        Err(rejection) => return rejection,
    };

    match state.events.flush(params.limit).await {
        Ok(report) => (rate_headers, Json(report)).into_response(),
        Err(err) => internal_error(err),
    }
}

/// Summed rollups, a time series, and the catalog for a filter window.
pub async fn get_event_summary(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<SummaryQuery>,
) -> Response {
    let rate_headers = match check_rate(
        &state,
        "events_read",
        state.rate_limits.read_per_min,
        &headers,
        Some(addr),
    ) {
        Ok(headers) => headers,
        Err(rejection) => return rejection,
    };

    match state.events.summary(&query).await {
        Ok(summary) => (rate_headers, Json(summary)).into_response(),
        Err(err) => internal_error(err),
    }
}

/// Known event names and the slugs seen so far.
pub async fn get_event_catalog(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let rate_headers = match check_rate(
        &state,
        "events_read",
        state.rate_limits.read_per_min,
        &headers,
        Some(addr),
    ) {
        Ok(headers) => headers,
        Err(rejection) => return rejection,
    };

    match state.events.catalog().await {
        Ok(catalog) => (rate_headers, Json(catalog)).into_response(),
        Err(err) => internal_error(err),
    }
}

fn request_context(headers: &HeaderMap, addr: SocketAddr) -> RequestContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
    };

    RequestContext {
        ip: Some(ratelimit::client_id(headers, Some(addr))),
        referrer: header("referer"),
        origin: header("origin"),
        user_agent: header("user-agent"),
    }
}
