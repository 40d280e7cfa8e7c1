//! REST API for correlated threat intelligence.

pub mod taxii;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use validator::Validate;

use crate::cache::{IocCache, PREPROCESSED_KEY};
use crate::correlation::CorrelationEngine;
use crate::enrichment::abuseipdb::AbuseIpDbClient;
use crate::exporters::{formats, stix};
use crate::models::{ApiHealth, BulkCheckRequest, CorrelatedIndicator, IocListParams, IocListResponse};
use crate::storage::IocRepo;

type ApiError = (StatusCode, Json<Value>);

/// Application state shared across handlers.
pub struct AppState {
    pub repo: IocRepo,
    pub cache: Option<IocCache>,
    pub engine: CorrelationEngine,
    pub abuse: Option<Arc<AbuseIpDbClient>>,
    pub daily_limit: i64,
    pub metrics: PrometheusHandle,
}

/// Create the API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/api/v1/iocs", get(list_iocs))
        .route("/api/v1/iocs/check", post(bulk_check))
        .route("/api/v1/iocs/export", get(export_iocs))
        .route("/api/v1/iocs/priority", get(priority_iocs))
        .route("/api/v1/stats", get(get_stats))
        .merge(taxii::routes())
        .with_state(state)
}

fn internal_error(e: anyhow::Error) -> ApiError {
    tracing::error!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

// ==================== Handlers ====================

async fn root() -> Json<Value> {
    Json(json!({
        "name": "threatfuse",
        "version": env!("CARGO_PKG_VERSION"),
        "health": "/health",
        "taxii": "/taxii2",
    }))
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<ApiHealth> {
    let database = state.repo.ping().await.is_ok();
    let daily_requests_used = if database {
        state.repo.daily_api_usage().await.unwrap_or(0)
    } else {
        0
    };

    let abuseipdb = state.abuse.is_some() && daily_requests_used < state.daily_limit;
    let status = if !database {
        "unhealthy"
    } else if !abuseipdb {
        "degraded"
    } else {
        "healthy"
    };

    Json(ApiHealth {
        status: status.to_string(),
        database,
        abuseipdb,
        timestamp: chrono::Utc::now(),
        daily_requests_used,
        daily_requests_limit: state.daily_limit,
    })
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}

/// Correlated IOCs from the local store, paginated.
async fn list_iocs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<IocListParams>,
) -> Result<Json<IocListResponse>, ApiError> {
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);

    let locals = state
        .repo
        .list_local_observations(params.min_confidence, params.fresh_only, params.skip, limit)
        .await
        .map_err(internal_error)?;

    let total = state
        .repo
        .count_local_observations(params.min_confidence, params.fresh_only)
        .await
        .map_err(internal_error)?;

    let external = if params.include_enrichment && !locals.is_empty() {
        let ips: Vec<String> = locals.iter().map(|o| o.ip_address.clone()).collect();
        state
            .repo
            .cached_enrichments_for(&ips)
            .await
            .map_err(internal_error)?
    } else {
        HashMap::new()
    };

    let items = state.engine.bulk_correlate(&locals, &external);

    Ok(Json(IocListResponse {
        total,
        items,
        page: params.skip / limit + 1,
        page_size: limit,
    }))
}

/// Check up to 100 IPs against the enrichment pipeline.
async fn bulk_check(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BulkCheckRequest>,
) -> Result<Json<Value>, ApiError> {
    if let Err(e) = request.validate() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        ));
    }

    let Some(abuse) = &state.abuse else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "AbuseIPDB enrichment is not configured" })),
        ));
    };

    let mut results = abuse
        .bulk_check_ips(&state.repo, &request.ip_addresses, 10)
        .await
        .map_err(internal_error)?;

    if request.force_refresh {
        // Re-run the requested IPs past the cache.
        for ip in &request.ip_addresses {
            if let Ok(Some(fresh)) = abuse.check_ip_with_cache(&state.repo, ip, true).await {
                results.insert(ip.clone(), Some(fresh));
            }
        }
    }

    Ok(Json(json!({
        "checked": request.ip_addresses.len(),
        "results": results,
    })))
}

#[derive(Debug, Deserialize)]
struct ExportParams {
    #[serde(default = "ExportParams::default_format")]
    format: String,
    #[serde(default)]
    include_metadata: bool,
    limit: Option<usize>,
}

impl ExportParams {
    fn default_format() -> String {
        "json".to_string()
    }
}

/// Export the preprocessed collection in a requested format.
async fn export_iocs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ExportParams>,
) -> Result<impl IntoResponse, ApiError> {
    let mut iocs = preprocessed_or_fresh(&state).await.map_err(internal_error)?;
    if let Some(limit) = params.limit {
        iocs.truncate(limit);
    }

    let (content_type, body) = match params.format.as_str() {
        "json" => (
            "application/json",
            formats::to_json(&iocs, true).map_err(internal_error)?,
        ),
        "stix" => (
            "application/stix+json;version=2.1",
            serde_json::to_string_pretty(&stix::create_bundle(&iocs))
                .map_err(|e| internal_error(e.into()))?,
        ),
        "csv" => ("text/csv", formats::to_csv(&iocs)),
        "txt" => ("text/plain", formats::to_txt(&iocs, params.include_metadata)),
        "elastic" => (
            "application/x-ndjson",
            formats::to_elastic_bulk(&iocs, "threats").map_err(internal_error)?,
        ),
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unsupported export format: {other}") })),
            ));
        }
    };

    Ok(([(header::CONTENT_TYPE, content_type)], body))
}

#[derive(Debug, Deserialize)]
struct PriorityParams {
    #[serde(default = "PriorityParams::default_limit")]
    limit: usize,
    #[serde(default = "PriorityParams::default_min_freshness")]
    min_freshness: f64,
}

impl PriorityParams {
    fn default_limit() -> usize {
        100
    }

    fn default_min_freshness() -> f64 {
        0.5
    }
}

/// Highest-priority IOCs: recent and confident first.
async fn priority_iocs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PriorityParams>,
) -> Result<Json<Value>, ApiError> {
    let iocs = preprocessed_or_fresh(&state).await.map_err(internal_error)?;
    let priority = state
        .engine
        .priority_subset(iocs, params.limit, params.min_freshness);

    Ok(Json(json!({
        "total": priority.len(),
        "items": priority,
    })))
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let total = state
        .repo
        .count_local_observations(None, false)
        .await
        .map_err(internal_error)?;
    let enriched = state
        .repo
        .count_cache_entries()
        .await
        .map_err(internal_error)?;
    let usage = state
        .repo
        .usage_last_7_days()
        .await
        .map_err(internal_error)?;

    let enrichment_percentage = if total > 0 {
        (enriched as f64 / total as f64 * 100.0 * 100.0).round() / 100.0
    } else {
        0.0
    };

    let cache_info = match &state.cache {
        Some(cache) => cache.cache_info(PREPROCESSED_KEY).await.unwrap_or(None),
        None => None,
    };

    Ok(Json(json!({
        "iocs": {
            "total": total,
            "enriched": enriched,
            "enrichment_percentage": enrichment_percentage,
        },
        "api_usage": {
            "last_7_days": usage,
            "daily_limit": state.daily_limit,
        },
        "cache": cache_info,
    })))
}

/// Preprocessed IOCs from Redis, or correlated on demand when the cache is
/// cold. On-demand results carry no geolocation; that stays the batch
/// driver's job.
pub(crate) async fn preprocessed_or_fresh(
    state: &AppState,
) -> anyhow::Result<Vec<CorrelatedIndicator>> {
    if let Some(cache) = &state.cache {
        if let Some(iocs) = cache.get_iocs(PREPROCESSED_KEY).await? {
            return Ok(iocs);
        }
    }

    tracing::debug!("preprocessed cache miss, correlating on demand");
    let locals = state.repo.all_local_observations().await?;
    let ips: Vec<String> = locals.iter().map(|o| o.ip_address.clone()).collect();
    let external = state.repo.cached_enrichments_for(&ips).await?;

    Ok(state.engine.bulk_correlate(&locals, &external))
}
