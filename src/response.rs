//! Standard response envelope helpers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Aggregate status of an envelope. Single-object operations are always
/// `Success` or `Failure`; batch and multi-id operations derive theirs
/// from the per-item outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStatus {
    Success,
    Failure,
    PartialSuccess,
}

impl ApiStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiStatus::Success => "success",
            ApiStatus::Failure => "failure",
            ApiStatus::PartialSuccess => "partial_success",
        }
    }

    /// Success iff every item succeeded, failure iff none did.
    pub fn aggregate(outcomes: impl IntoIterator<Item = bool>) -> ApiStatus {
        let mut any_ok = false;
        let mut any_err = false;
        for ok in outcomes {
            if ok {
                any_ok = true;
            } else {
                any_err = true;
            }
        }
        match (any_ok, any_err) {
            (_, false) => ApiStatus::Success,
            (false, true) => ApiStatus::Failure,
            (true, true) => ApiStatus::PartialSuccess,
        }
    }
}

/// A fully materialized JSON response. Handlers produce these so hooks
/// and error mappers can substitute one wholesale.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(StatusCode::OK, body)
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn success(result: Value) -> ApiResponse {
    ApiResponse::ok(json!({ "status": "success", "result": result }))
}

/// Success envelope with extra top-level meta keys (pagination counters
/// and the like) merged beside `status`/`result`.
pub fn success_with_meta(result: Value, meta: Map<String, Value>) -> ApiResponse {
    let mut body = Map::new();
    body.insert("status".to_string(), Value::String("success".to_string()));
    body.insert("result".to_string(), result);
    for (key, value) in meta {
        body.insert(key, value);
    }
    ApiResponse::ok(Value::Object(body))
}

pub fn with_status(status: ApiStatus, result: Value) -> ApiResponse {
    ApiResponse::ok(json!({ "status": status.as_str(), "result": result }))
}

/// Per-item outcome inside a batch or multi-id result.
pub fn item_success(result: Value) -> Value {
    json!({ "status": "success", "result": result })
}

pub fn item_failure(error: Value) -> Value {
    json!({ "status": "failure", "error": error })
}

/// Batch rows echo the raw input beside the outcome so a caller can line
/// failures back up with what was sent.
pub fn item_with_input(mut outcome: Value, input: &Value) -> Value {
    if let Value::Object(map) = &mut outcome {
        map.insert("input".to_string(), input.clone());
    }
    outcome
}

pub fn item_is_success(item: &Value) -> bool {
    item.get("status").and_then(Value::as_str) == Some("success")
}
