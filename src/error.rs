//! Typed errors and HTTP mapping.

use std::collections::BTreeMap;
use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::response::ApiResponse;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown model: '{0}'")]
    UnknownModel(String),
    #[error("unknown relation: {model}.{relation}")]
    UnknownRelation { model: String, relation: String },
    #[error("unknown field: {model}.{field}")]
    UnknownField { model: String, field: String },
    #[error("duplicate url slug: {0}")]
    DuplicateSlug(String),
    #[error("duplicate route: {method} {url}")]
    DuplicateRoute { method: &'static str, url: String },
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Per-field validation messages, keyed by field name. Nested and
/// array items use dotted keys (`"0.title"`, `"user.email"`).
#[derive(Debug, Default, Clone)]
pub struct ValidationErrors {
    pub fields: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields.entry(field.into()).or_default().push(message.into());
    }

    /// Folds `other` in under a key prefix, as when validating one item
    /// of an array payload.
    pub fn merge_prefixed(&mut self, prefix: &str, other: ValidationErrors) {
        for (field, messages) in other.fields {
            let key = if field.is_empty() {
                prefix.to_string()
            } else {
                format!("{}.{}", prefix, field)
            };
            self.fields.entry(key).or_default().extend(messages);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn into_value(self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .fields
            .into_iter()
            .map(|(field, messages)| {
                (
                    field,
                    serde_json::Value::Array(
                        messages.into_iter().map(serde_json::Value::String).collect(),
                    ),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.fields {
            for message in messages {
                if !first {
                    write!(f, "; ")?;
                }
                write!(f, "{}: {}", field, message)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    AccessDenied(String),
    #[error("validation: {0}")]
    Validation(ValidationErrors),
    #[error("PAGE_NOT_FOUND")]
    PageNotFound { total_pages: u64 },
    #[error("{0}")]
    BadRequest(String),
    #[error("database: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ApiError {
    pub fn not_found() -> Self {
        ApiError::NotFound("Resource not found".to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) | ApiError::PageNotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::AccessDenied(_) => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_)
            | ApiError::BadRequest(_)
            | ApiError::Store(_)
            | ApiError::Config(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// The value carried under the envelope's `error` key: structured
    /// field messages for validation failures, a plain string otherwise.
    pub fn error_value(&self) -> serde_json::Value {
        match self {
            ApiError::Validation(errors) => errors.clone().into_value(),
            other => serde_json::Value::String(other.to_string()),
        }
    }

    pub fn envelope(&self) -> ApiResponse {
        let mut body = serde_json::Map::new();
        body.insert(
            "status".to_string(),
            serde_json::Value::String("failure".to_string()),
        );
        body.insert("error".to_string(), self.error_value());
        if let ApiError::PageNotFound { total_pages } = self {
            body.insert(
                "total_pages".to_string(),
                serde_json::Value::Number((*total_pages).into()),
            );
        }
        ApiResponse::new(self.status_code(), serde_json::Value::Object(body))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.envelope().into_response()
    }
}
