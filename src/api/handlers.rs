use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditStore, MetricPair, NewAuditEntry};
use crate::cache::SingleFlight;
use crate::config::{Config, RateLimitConfig};
use crate::counters::{
    validate_overwrite, CounterBackend, CounterStore, DurableCounterBackend, FieldError,
    KvCounterBackend, MembershipSets, MemoryCounterBackend, Metrics, MetricsQuery,
    OverwriteRequest,
};
use crate::events::EventStore;
use crate::heatmap::{
    HeatmapBackend, HeatmapSnapshot, HeatmapStore, KvHeatmapBackend, MemoryHeatmapBackend,
};
use crate::identity;
use crate::kv::KvTier;
use crate::ratelimit::{self, RateLimiter};
use crate::storage::DurableStore;

/// TTLs for the single-flight read caches: viewer-bound reads stay fresh,
/// anonymous reads coast a little longer.
const SESSION_READ_TTL: Duration = Duration::from_secs(3);
const ANON_READ_TTL: Duration = Duration::from_secs(12);

pub struct AppState {
    pub counters: Arc<CounterStore>,
    pub heatmap: Arc<HeatmapStore>,
    pub events: Arc<EventStore>,
    pub audit: Arc<AuditStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub rate_limits: RateLimitConfig,
    pub production: bool,
    metrics_session_cache: SingleFlight<Metrics>,
    metrics_anon_cache: SingleFlight<Metrics>,
    heatmap_cache: SingleFlight<HeatmapSnapshot>,
}

impl AppState {
    /// Wire the storage cascade from whichever tiers are configured. The
    /// memory tier is always last so no operation is ever without a home.
    pub fn new(
        kv: Option<Arc<dyn KvTier>>,
        durable: Option<Arc<dyn DurableStore>>,
        config: &Config,
    ) -> Self {
        let membership = Arc::new(MembershipSets::new());

        let mut counter_backends: Vec<Arc<dyn CounterBackend>> = Vec::new();
        if let Some(kv) = &kv {
            counter_backends.push(Arc::new(KvCounterBackend::new(Arc::clone(kv))));
        }
        if let Some(durable) = &durable {
            counter_backends.push(Arc::new(DurableCounterBackend::new(
                Arc::clone(durable),
                Arc::clone(&membership),
            )));
        }
        counter_backends.push(Arc::new(MemoryCounterBackend::new(membership)));

        let mut heatmap_backends: Vec<Arc<dyn HeatmapBackend>> = Vec::new();
        if let Some(kv) = &kv {
            heatmap_backends.push(Arc::new(KvHeatmapBackend::new(Arc::clone(kv))));
        }
        heatmap_backends.push(Arc::new(MemoryHeatmapBackend::new()));

        Self {
            counters: Arc::new(CounterStore::new(counter_backends)),
            heatmap: Arc::new(HeatmapStore::new(heatmap_backends, durable.clone())),
            events: Arc::new(EventStore::new(kv.clone(), durable.clone())),
            audit: Arc::new(AuditStore::new(kv, durable)),
            rate_limiter: Arc::new(RateLimiter::new()),
            rate_limits: config.rate_limits.clone(),
            production: config.production,
            metrics_session_cache: SingleFlight::new(SESSION_READ_TTL, 10_000),
            metrics_anon_cache: SingleFlight::new(ANON_READ_TTL, 10_000),
            heatmap_cache: SingleFlight::new(ANON_READ_TTL, 1_000),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct ValidationErrorResponse {
    pub error: String,
    pub fields: Vec<FieldError>,
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub message: String,
}

/// Apply the fixed-window limiter for one endpoint bucket. Returns the
/// rate-limit headers for the eventual response, or the finished 429.
pub(super) fn check_rate(
    state: &AppState,
    bucket_id: &str,
    limit: u32,
    headers: &HeaderMap,
    addr: Option<SocketAddr>,
) -> Result<HeaderMap, Response> {
    let client = ratelimit::client_id(headers, addr);
    let decision =
        state
            .rate_limiter
            .apply(bucket_id, &client, limit, chrono::Duration::seconds(60));

    let mut rate_headers = HeaderMap::new();
    ratelimit::set_rate_limit_headers(&mut rate_headers, &decision);

    if decision.ok {
        Ok(rate_headers)
    } else {
        Err((
            StatusCode::TOO_MANY_REQUESTS,
            rate_headers,
            Json(ErrorResponse {
                error: "Rate limit exceeded".to_string(),
            }),
        )
            .into_response())
    }
}

pub(super) fn internal_error(err: anyhow::Error) -> Response {
    tracing::error!("request failed: {err:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "Internal server error".to_string(),
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct MetricsParams {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct LikeRequest {
    pub liked: Option<bool>,
}

/// Get counters for a slug. Reads the viewer cookie but never sets one.
pub async fn get_metrics(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Query(params): Query<MetricsParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    let rate_headers = match check_rate(
        &state,
        "metrics_read",
        state.rate_limits.read_per_min,
        &headers,
        Some(addr),
    ) {
        Ok(headers) => headers,
        Err(rejection) => return rejection,
    };

    let viewer = identity::viewer_id(&jar);
    let query = MetricsQuery {
        viewer_id: viewer.clone(),
        start_date: params.start_date,
        end_date: params.end_date,
    };

    let cache = if viewer.is_some() {
        &state.metrics_session_cache
    } else {
        &state.metrics_anon_cache
    };
    let key = format!(
        "{slug}|{}|{}|{}",
        viewer.as_deref().unwrap_or("-"),
        query.start_date.as_deref().unwrap_or("-"),
        query.end_date.as_deref().unwrap_or("-"),
    );

    let counters = Arc::clone(&state.counters);
    let result = cache
        .resolve(&key, move || async move {
            counters.get_metrics(&slug, &query).await
        })
        .await;

    match result {
        Ok(metrics) => (rate_headers, Json(metrics)).into_response(),
        Err(err) => internal_error(err),
    }
}

/// Count a view, minting the viewer cookie when absent.
pub async fn bump_view(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    let rate_headers = match check_rate(
        &state,
        "metrics_write",
        state.rate_limits.write_per_min,
        &headers,
        Some(addr),
    ) {
        Ok(headers) => headers,
        Err(rejection) => return rejection,
    };

    let (jar, viewer) = identity::ensure_viewer_id(jar, state.production);

    match state.counters.bump_view(&slug, Some(&viewer)).await {
        Ok(outcome) => (jar, rate_headers, Json(outcome)).into_response(),
        Err(err) => internal_error(err),
    }
}

/// Toggle or set the like state, minting the viewer cookie when absent.
pub async fn set_like_state(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(request): Json<LikeRequest>,
) -> Response {
    let rate_headers = match check_rate(
        &state,
        "metrics_write",
        state.rate_limits.write_per_min,
        &headers,
        Some(addr),
    ) {
        Ok(headers) => headers,
        Err(rejection) => return rejection,
    };

    let (jar, viewer) = identity::ensure_viewer_id(jar, state.production);

    match state
        .counters
        .set_like_state(&slug, Some(&viewer), request.liked)
        .await
    {
        Ok(outcome) => (jar, rate_headers, Json(outcome)).into_response(),
        Err(err) => internal_error(err),
    }
}

#[derive(Serialize)]
pub struct OverwriteResponse {
    pub views: u64,
    pub likes: u64,
}

/// Admin absolute set. Validates field by field, records an audit entry,
/// and clears per-viewer membership for the slug.
pub async fn overwrite_metrics(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<OverwriteRequest>,
) -> Response {
    let rate_headers = match check_rate(
        &state,
        "metrics_admin",
        state.rate_limits.admin_per_min,
        &headers,
        Some(addr),
    ) {
        Ok(headers) => headers,
        Err(rejection) => return rejection,
    };

    let patch = match validate_overwrite(&request) {
        Ok(patch) => patch,
        Err(fields) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ValidationErrorResponse {
                    error: "Invalid metric values".to_string(),
                    fields,
                }),
            )
                .into_response();
        }
    };

    let before = match state.counters.get_metrics(&slug, &MetricsQuery::default()).await {
        Ok(metrics) => MetricPair {
            views: metrics.views,
            likes: metrics.likes,
        },
        Err(err) => return internal_error(err),
    };

    let (views, likes) = match state.counters.overwrite_metrics(&slug, &patch).await {
        Ok(result) => result,
        Err(err) => return internal_error(err),
    };

    let audit_entry = NewAuditEntry {
        slug: slug.clone(),
        changed_by: request.changed_by.unwrap_or_else(|| "admin".to_string()),
        changed_at: None,
        before,
        after: MetricPair { views, likes },
    };
    if let Err(err) = state.audit.record(vec![audit_entry]).await {
        tracing::warn!(error = %err, slug = %slug, "failed to record metrics audit entry");
    }

    state.metrics_anon_cache.invalidate(&format!("{slug}|-|-|-")).await;

    (rate_headers, Json(OverwriteResponse { views, likes })).into_response()
}

/// Health check endpoint
pub async fn health_check() -> Json<SuccessResponse> {
    Json(SuccessResponse {
        message: "OK".to_string(),
    })
}

pub(super) async fn cached_heatmap_snapshot(
    state: &AppState,
    slug: String,
) -> anyhow::Result<HeatmapSnapshot> {
    let heatmap = Arc::clone(&state.heatmap);
    let key = slug.clone();
    state
        .heatmap_cache
        .resolve(&key, move || async move { heatmap.snapshot(&slug).await })
        .await
}
