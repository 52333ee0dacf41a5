//! DELETE: remove a single row, optionally answering with a related
//! object reached through `_ret`.

use std::sync::Arc;

use serde_json::Value;

use crate::entity::{HookArgs, Operation};
use crate::error::ApiError;
use crate::model::{EntityRuntime, ModelDescriptor};
use crate::response::{self, ApiResponse};
use crate::service::query::QueryParams;
use crate::state::AppState;
use crate::store::Row;

use super::{
    check_access, finish, invalidate_entity_cache, render_ret, resolve_required, resolve_ret,
    run_after_hooks, run_before_hooks, RetValue,
};

pub async fn entry(
    state: AppState,
    rt: Arc<EntityRuntime>,
    id: String,
    params: QueryParams,
) -> ApiResponse {
    let result = handle(&state, &rt, &id, &params).await;
    finish(&rt, Operation::Delete, result)
}

async fn handle(
    state: &AppState,
    rt: &EntityRuntime,
    id: &str,
    params: &QueryParams,
) -> Result<ApiResponse, ApiError> {
    let existing = resolve_required(state, rt, Operation::Delete, id, params).await?;

    let mut args = HookArgs::new(
        state.store.as_ref(),
        &state.graph,
        &rt.model,
        &rt.entity.slug,
        Operation::Delete,
        params,
    );
    args.id = Some(id);
    args.existing = Some(&existing);
    check_access(rt, Operation::Delete, &args).await?;

    let mut working = existing.clone();
    if let Some(response) =
        run_before_hooks(rt.entity.before_hooks(Operation::Delete), &args, &mut working).await?
    {
        return Ok(response);
    }

    // The walk needs the source row's foreign keys, so `_ret` resolves
    // before the delete and the targets are re-read afterwards.
    let captured = match params.get("_ret") {
        Some(path) => Some(resolve_ret(state, &rt.model, &existing, path).await?),
        None => None,
    };

    let pk = existing
        .get(&rt.model.primary_key)
        .cloned()
        .unwrap_or(Value::Null);
    state
        .store
        .delete(&rt.model, &pk)
        .await?
        .ok_or_else(ApiError::not_found)?;
    invalidate_entity_cache(state, rt);

    let mut snapshot = existing.clone();
    if let Some(response) =
        run_after_hooks(rt.entity.after_hooks(Operation::Delete), &args, &mut snapshot).await?
    {
        return Ok(response);
    }
    drop(args);

    match captured {
        Some((target, value)) => {
            let refreshed = refresh(state, &target, value).await?;
            Ok(response::success(
                render_ret(state, &target, refreshed).await?,
            ))
        }
        None => Ok(response::success(Value::Null)),
    }
}

/// Re-reads captured rows so cascades triggered by the delete show
/// through. Rows that vanished keep their captured state.
async fn refresh(
    state: &AppState,
    target: &Arc<ModelDescriptor>,
    value: RetValue,
) -> Result<RetValue, ApiError> {
    match value {
        RetValue::One(None) => Ok(RetValue::One(None)),
        RetValue::One(Some(row)) => Ok(RetValue::One(Some(refetch(state, target, row).await?))),
        RetValue::Many(rows) => {
            let mut fresh = Vec::with_capacity(rows.len());
            for row in rows {
                fresh.push(refetch(state, target, row).await?);
            }
            Ok(RetValue::Many(fresh))
        }
    }
}

async fn refetch(state: &AppState, target: &ModelDescriptor, row: Row) -> Result<Row, ApiError> {
    let pk = row.get(&target.primary_key).cloned().unwrap_or(Value::Null);
    if pk.is_null() {
        return Ok(row);
    }
    let fresh = state
        .store
        .find_by_field(target, &target.primary_key, &pk)
        .await?;
    Ok(fresh.unwrap_or(row))
}
