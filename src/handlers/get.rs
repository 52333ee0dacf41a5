//! GET one row, or a bracketed id list fanned out into a keyed map.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::cache::ResponseCache;
use crate::entity::{Access, HookArgs, Operation};
use crate::error::ApiError;
use crate::model::EntityRuntime;
use crate::response::{self, ApiResponse, ApiStatus};
use crate::service::query::QueryParams;
use crate::state::AppState;
use crate::store::Row;

use super::{check_access, fetch_by_lookup, finish, shaped_row};

pub async fn entry(
    state: AppState,
    rt: Arc<EntityRuntime>,
    id: Option<String>,
    params: QueryParams,
) -> ApiResponse {
    let result = handle(&state, &rt, id.as_deref(), &params).await;
    finish(&rt, Operation::Get, result)
}

async fn handle(
    state: &AppState,
    rt: &EntityRuntime,
    id: Option<&str>,
    params: &QueryParams,
) -> Result<ApiResponse, ApiError> {
    let policy = rt.entity.cache_for(Operation::Get);
    let key = policy.map(|_| {
        ResponseCache::key(
            &format!("/{}/{}", rt.entity.slug, id.unwrap_or_default()),
            params,
        )
    });
    if let Some(key) = &key {
        if let Some((status, body)) = state.cache.get(key) {
            return Ok(ApiResponse::new(status, body));
        }
    }

    let response = compute(state, rt, id, params).await?;
    if let (Some(policy), Some(key)) = (policy, key) {
        state
            .cache
            .put(key, policy.ttl, response.status, response.body.clone());
    }
    Ok(response)
}

async fn compute(
    state: &AppState,
    rt: &EntityRuntime,
    id: Option<&str>,
    params: &QueryParams,
) -> Result<ApiResponse, ApiError> {
    if let Some(raw) = id {
        let raw = raw.trim();
        if raw.starts_with('[') && raw.ends_with(']') {
            return multi_get(state, rt, raw, params).await;
        }
    }
    single_get(state, rt, id, params).await
}

async fn single_get(
    state: &AppState,
    rt: &EntityRuntime,
    id: Option<&str>,
    params: &QueryParams,
) -> Result<ApiResponse, ApiError> {
    let mut args = HookArgs::new(
        state.store.as_ref(),
        &state.graph,
        &rt.model,
        &rt.entity.slug,
        Operation::Get,
        params,
    );
    args.id = id;

    let row = match &rt.entity.get.getter {
        Some(getter) => getter.fetch(&args).await?,
        None => match id {
            Some(id) => fetch_by_lookup(state, rt, Operation::Get, id, params).await?,
            None => None,
        },
    };
    let row = row.ok_or_else(ApiError::not_found)?;

    args.existing = Some(&row);
    check_access(rt, Operation::Get, &args).await?;
    drop(args);

    let value = shaped_row(state, rt, Operation::Get, params, row).await?;
    Ok(response::success(value))
}

/// `/tasks/[1,2,3]` fans out into per-id lookups; the result maps each
/// id, as written, to that id's own outcome. Missing or denied rows
/// fail individually without failing the request.
async fn multi_get(
    state: &AppState,
    rt: &EntityRuntime,
    raw: &str,
    params: &QueryParams,
) -> Result<ApiResponse, ApiError> {
    let mut found: Vec<(String, Option<Row>)> = Vec::new();

    if let Some(getter) = &rt.entity.get.getter {
        let mut args = HookArgs::new(
            state.store.as_ref(),
            &state.graph,
            &rt.model,
            &rt.entity.slug,
            Operation::Get,
            params,
        );
        args.id = Some(raw);
        let inner = raw[1..raw.len() - 1].to_string();
        found.push((inner, getter.fetch(&args).await?));
    } else {
        let ids: Vec<Value> = serde_json::from_str(raw)
            .map_err(|e| ApiError::BadRequest(format!("invalid id list: {}", e)))?;
        for id in ids {
            let key = super::id_key(&id);
            let row = fetch_by_lookup(state, rt, Operation::Get, &key, params).await?;
            found.push((key, row));
        }
    }

    if let Some(checker) = rt.entity.access_for(Operation::Get) {
        for (_, slot) in found.iter_mut() {
            if let Some(row) = slot {
                let mut args = HookArgs::new(
                    state.store.as_ref(),
                    &state.graph,
                    &rt.model,
                    &rt.entity.slug,
                    Operation::Get,
                    params,
                );
                args.existing = Some(row);
                if matches!(checker.check(&args).await?, Access::Denied(_)) {
                    *slot = None;
                }
            }
        }
    }

    let statuses: Vec<bool> = found.iter().map(|(_, row)| row.is_some()).collect();
    let mut result = Map::new();
    for (key, slot) in found {
        let item = match slot {
            Some(row) => {
                let value = shaped_row(state, rt, Operation::Get, params, row).await?;
                response::item_success(value)
            }
            None => response::item_failure(json!("Resource not found")),
        };
        result.insert(key, item);
    }
    Ok(response::with_status(
        ApiStatus::aggregate(statuses),
        Value::Object(result),
    ))
}
