//! Audit log API handlers

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
use crate::audit::{AuditEntry, AuditFilter};

#[derive(Deserialize)]
pub struct AuditListParams {
    /// Comma-separated slug filter.
    pub slugs: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct AuditListResponse {
    pub entries: Vec<AuditEntry>,
    pub total: usize,
}

/// Newest audit entries, optionally filtered by slug set.
pub async fn list_metrics_audit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<AuditListParams>,
) -> Response {
    let rate_headers = match check_rate(
        &state,
        "audit_read",
        state.rate_limits.admin_per_min,
        &headers,
        Some(addr),
    ) {
        Ok(headers) => headers,
        Err(rejection) => return rejection,
    };

    let slugs = params.slugs.map(|raw| {
        raw.split(',')
            .map(|slug| slug.trim().to_string())
            .filter(|slug| !slug.is_empty())
            .collect::<Vec<_>>()
    });

    let filter = AuditFilter {
        slugs,
        limit: params.limit,
    };

    match state.audit.list(&filter).await {
        Ok(entries) => {
            let total = entries.len();
            (rate_headers, Json(AuditListResponse { entries, total })).into_response()
        }
        Err(err) => internal_error(err),
    }
}
