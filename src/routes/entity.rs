//! CRUD routes generated from entity registrations. Handlers are
//! closures capturing their entity runtime; URL shapes come from
//! `EntityRuntime::url_for`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::routing::{delete, get, patch, post, put, MethodRouter};
use axum::Router;

use crate::entity::Operation;
use crate::error::ConfigError;
use crate::handlers;
use crate::model::EntityRuntime;
use crate::service::query::QueryParams;
use crate::state::AppState;

type Params = Query<Vec<(String, String)>>;

pub(super) fn entity_routes(
    state: &AppState,
    order: &[String],
) -> Result<Router<AppState>, ConfigError> {
    let mut router = Router::new();
    for slug in order {
        let rt = state
            .runtime(slug)
            .map_err(|e| ConfigError::InvalidDescriptor(e.to_string()))?;
        for op in rt.ops.clone() {
            router = router.route(&rt.url_for(op), method_router(&rt, op));
        }
    }
    Ok(router)
}

fn method_router(rt: &Arc<EntityRuntime>, op: Operation) -> MethodRouter<AppState> {
    let rt = rt.clone();
    match op {
        Operation::Index => get(
            move |State(state): State<AppState>, Query(params): Params| {
                let rt = rt.clone();
                async move { handlers::index::entry(state, rt, QueryParams(params)).await }
            },
        ),
        Operation::Get if rt.url_for(Operation::Get).contains(":id") => get(
            move |State(state): State<AppState>,
                  Path(id): Path<String>,
                  Query(params): Params| {
                let rt = rt.clone();
                async move { handlers::get::entry(state, rt, Some(id), QueryParams(params)).await }
            },
        ),
        // Custom GET url without an :id segment; the object getter
        // resolves the target instead.
        Operation::Get => get(
            move |State(state): State<AppState>, Query(params): Params| {
                let rt = rt.clone();
                async move { handlers::get::entry(state, rt, None, QueryParams(params)).await }
            },
        ),
        Operation::Post => post(
            move |State(state): State<AppState>, Query(params): Params, body: Bytes| {
                let rt = rt.clone();
                async move { handlers::post::entry(state, rt, QueryParams(params), body).await }
            },
        ),
        Operation::Put => put(
            move |State(state): State<AppState>,
                  Path(id): Path<String>,
                  Query(params): Params,
                  body: Bytes| {
                let rt = rt.clone();
                async move { handlers::put::entry(state, rt, id, QueryParams(params), body).await }
            },
        ),
        Operation::Patch => patch(
            move |State(state): State<AppState>,
                  Path(id): Path<String>,
                  Query(params): Params,
                  body: Bytes| {
                let rt = rt.clone();
                async move {
                    handlers::patch::entry(state, rt, id, QueryParams(params), body).await
                }
            },
        ),
        Operation::Delete => delete(
            move |State(state): State<AppState>,
                  Path(id): Path<String>,
                  Query(params): Params| {
                let rt = rt.clone();
                async move { handlers::delete::entry(state, rt, id, QueryParams(params)).await }
            },
        ),
        Operation::BatchSave => post(move |State(state): State<AppState>, req: Request| {
            let rt = rt.clone();
            async move { handlers::batch_save::entry(state, rt, req).await }
        }),
    }
}
