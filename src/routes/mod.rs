//! Router assembly: generated entity routes plus the common endpoints.

mod common;
mod entity;

use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;

use crate::error::ConfigError;
use crate::state::AppState;

/// Final router for a mount: per-entity CRUD routes, job polling and
/// registry dumps, an enveloped 404 fallback, and the body size limit,
/// all nested under the configured mount path.
pub(crate) fn build_router(state: AppState, order: &[String]) -> Result<Router, ConfigError> {
    let mut router = entity::entity_routes(&state, order)?;
    router = router.merge(common::common_routes(&state));
    let router = match state.config.mount_path.trim_matches('/') {
        "" => router,
        prefix => Router::new().nest(&format!("/{}", prefix), router),
    };
    Ok(router
        .fallback(common::not_found)
        .layer(RequestBodyLimitLayer::new(state.config.body_limit_bytes))
        .with_state(state))
}
