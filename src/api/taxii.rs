//! TAXII 2.1 endpoints.
//!
//! Read-only server with two collections, answering from the preprocessed
//! Redis cache. Responses follow the fixed TAXII 2.1 JSON shapes; STIX
//! objects come from the exporters.

use std::sync::Arc;

use axum::{
    extract::{Host, Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{preprocessed_or_fresh, AppState};
use crate::cache::{HIGH_CONFIDENCE_KEY, PREPROCESSED_KEY};
use crate::exporters::stix;
use crate::models::CorrelatedIndicator;

const COLLECTION_ALL: &str = "ioc-indicators";
const COLLECTION_HIGH: &str = "high-confidence-iocs";

/// Confidence floor of the high-confidence collection.
const HIGH_CONFIDENCE_MINIMUM: i32 = 80;

const TAXII_MEDIA_TYPE: &str = "application/taxii+json;version=2.1";
const STIX_MEDIA_TYPE: &str = "application/stix+json;version=2.1";

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/taxii2", get(discovery))
        .route("/taxii2/iocs", get(api_root))
        .route("/taxii2/iocs/collections", get(list_collections))
        .route("/taxii2/iocs/collections/:collection_id", get(get_collection))
        .route(
            "/taxii2/iocs/collections/:collection_id/objects",
            get(collection_objects),
        )
        .route(
            "/taxii2/iocs/collections/:collection_id/manifest",
            get(collection_manifest),
        )
        .route("/taxii2/iocs/status/:status_id", get(get_status))
}

fn collection_info(collection_id: &str) -> Option<Value> {
    match collection_id {
        COLLECTION_ALL => Some(json!({
            "id": COLLECTION_ALL,
            "title": "IOC Indicators",
            "description": "IP-based indicators of compromise from local detections and AbuseIPDB",
            "can_read": true,
            "can_write": false,
            "media_types": [STIX_MEDIA_TYPE],
        })),
        COLLECTION_HIGH => Some(json!({
            "id": COLLECTION_HIGH,
            "title": "High Confidence IOCs",
            "description": "High confidence IOCs (>= 80% fused confidence score)",
            "can_read": true,
            "can_write": false,
            "media_types": [STIX_MEDIA_TYPE],
        })),
        _ => None,
    }
}

async fn discovery(Host(host): Host) -> Json<Value> {
    let base = format!("http://{host}");
    Json(json!({
        "title": "threatfuse TAXII 2.1 Server",
        "description": "TAXII 2.1 server providing IOCs fused from local detections and AbuseIPDB",
        "default": format!("{base}/taxii2/iocs"),
        "api_roots": [format!("{base}/taxii2/iocs")],
    }))
}

async fn api_root() -> Json<Value> {
    Json(json!({
        "title": "threatfuse IOC TAXII Root",
        "description": "Threat intelligence IOCs from local detections and AbuseIPDB",
        "versions": [TAXII_MEDIA_TYPE],
        "max_content_length": 10_485_760,
    }))
}

async fn list_collections() -> Json<Value> {
    let collections: Vec<Value> = [COLLECTION_ALL, COLLECTION_HIGH]
        .iter()
        .filter_map(|id| collection_info(id))
        .collect();
    Json(json!({ "collections": collections }))
}

async fn get_collection(
    Path(collection_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    collection_info(&collection_id).map(Json).ok_or((
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Collection not found" })),
    ))
}

#[derive(Debug, Deserialize)]
struct ObjectsParams {
    limit: Option<usize>,
    added_after: Option<DateTime<Utc>>,
}

/// STIX objects from a collection, wrapped in the TAXII envelope.
async fn collection_objects(
    State(state): State<Arc<AppState>>,
    Path(collection_id): Path<String>,
    Query(params): Query<ObjectsParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if collection_info(&collection_id).is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Collection not found" })),
        ));
    }

    let limit = params.limit.unwrap_or(100).clamp(1, 10_000);
    let iocs = collection_iocs(&state, &collection_id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, collection_id, "failed to load collection objects");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error" })),
            )
        })?;

    let filtered: Vec<CorrelatedIndicator> = iocs
        .into_iter()
        .filter(|ioc| match params.added_after {
            Some(after) => ioc.reported_at > after,
            None => true,
        })
        .collect();

    let total = filtered.len();
    let page: Vec<CorrelatedIndicator> = filtered.into_iter().take(limit).collect();
    let bundle = stix::create_bundle(&page);

    tracing::info!(
        collection_id,
        returned = page.len(),
        total,
        "TAXII objects served"
    );

    Ok(Json(json!({
        "more": total > limit,
        "data": bundle,
    })))
}

#[derive(Debug, Deserialize)]
struct ManifestParams {
    limit: Option<i64>,
    added_after: Option<DateTime<Utc>>,
}

/// Manifest entries for a collection, read straight from the local store so
/// ids and timestamps line up with the objects endpoint.
async fn collection_manifest(
    State(state): State<Arc<AppState>>,
    Path(collection_id): Path<String>,
    Query(params): Query<ManifestParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if collection_info(&collection_id).is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Collection not found" })),
        ));
    }

    let limit = params.limit.unwrap_or(100).clamp(1, 10_000);
    let min_confidence = (collection_id == COLLECTION_HIGH).then_some(HIGH_CONFIDENCE_MINIMUM);

    let locals = state
        .repo
        .list_local_observations(min_confidence, false, 0, limit)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to load manifest entries");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error" })),
            )
        })?;

    let objects: Vec<Value> = locals
        .iter()
        .filter(|obs| match params.added_after {
            Some(after) => obs.reported_at > after,
            None => true,
        })
        .map(|obs| {
            json!({
                "id": stix::indicator_id(&obs.ip_address),
                "date_added": obs.reported_at,
                "version": "1",
                "media_type": STIX_MEDIA_TYPE,
            })
        })
        .collect();

    Ok(Json(json!({
        "more": objects.len() as i64 >= limit,
        "objects": objects,
    })))
}

/// Status stub for TAXII compliance; this server is read-only.
async fn get_status(Path(status_id): Path<String>) -> Json<Value> {
    Json(json!({
        "id": status_id,
        "status": "complete",
        "request_timestamp": Utc::now(),
        "total_count": 0,
        "success_count": 0,
        "failure_count": 0,
    }))
}

/// Load the IOC collection backing a TAXII collection id.
async fn collection_iocs(
    state: &AppState,
    collection_id: &str,
) -> anyhow::Result<Vec<CorrelatedIndicator>> {
    let cache_key = if collection_id == COLLECTION_HIGH {
        HIGH_CONFIDENCE_KEY
    } else {
        PREPROCESSED_KEY
    };

    if let Some(cache) = &state.cache {
        if let Some(iocs) = cache.get_iocs(cache_key).await? {
            return Ok(iocs);
        }
        tracing::warn!(
            collection_id,
            "no preprocessed cache for collection; falling back to on-demand correlation"
        );
    }

    let iocs = preprocessed_or_fresh(state).await?;
    if collection_id == COLLECTION_HIGH {
        Ok(state
            .engine
            .filter_by_confidence(iocs, Some(HIGH_CONFIDENCE_MINIMUM)))
    } else {
        Ok(iocs)
    }
}
