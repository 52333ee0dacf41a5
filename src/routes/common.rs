//! Common routes: health, version, batch job polling, and the
//! registry dumps.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ApiError;
use crate::response::{self, ApiResponse};
use crate::state::AppState;
use crate::store::StoreError;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

async fn version() -> Json<Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /batch-jobs/:id. Polls a job submitted through an async batch
/// save.
async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiResponse, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::BadRequest("invalid job id".into()))?;
    let job = state.jobs.get(&id).ok_or_else(ApiError::not_found)?;
    let value = serde_json::to_value(&job).map_err(|e| StoreError::Database(e.to_string()))?;
    Ok(response::success(value))
}

/// Registry dumps change only at mount time, so they sit in the
/// response cache under the long introspection TTL. Both are raw JSON
/// without the envelope.
fn cached_dump(state: &AppState, key: String, value: Result<Value, serde_json::Error>) -> ApiResponse {
    if let Some((status, body)) = state.cache.get(&key) {
        return ApiResponse::new(status, body);
    }
    let body = match value {
        Ok(body) => body,
        Err(e) => return ApiError::Store(StoreError::Database(e.to_string())).envelope(),
    };
    let response = ApiResponse::ok(body);
    state.cache.put(
        key,
        state.config.introspection_cache_ttl,
        response.status,
        response.body.clone(),
    );
    response
}

async fn schema_def(State(state): State<AppState>) -> ApiResponse {
    let key = state.config.schema_definition_url.clone();
    let value = serde_json::to_value(state.registry.as_ref());
    cached_dump(&state, key, value)
}

async fn views_map(State(state): State<AppState>) -> ApiResponse {
    let key = state.config.views_map_url.clone();
    let value = serde_json::to_value(&state.registry.views);
    cached_dump(&state, key, value)
}

pub(super) async fn not_found() -> ApiResponse {
    ApiError::not_found().envelope()
}

pub(super) fn common_routes(state: &AppState) -> Router<AppState> {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/batch-jobs/:id", get(job_status));
    if state.config.register_schema_definition {
        router = router.route(&state.config.schema_definition_url, get(schema_def));
    }
    if state.config.register_views_map {
        router = router.route(&state.config.views_map_url, get(views_map));
    }
    router
}
