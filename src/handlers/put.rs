//! PUT: partial update of a single row.

use std::sync::Arc;

use serde_json::Value;

use crate::entity::{HookArgs, Operation};
use crate::error::ApiError;
use crate::model::EntityRuntime;
use crate::response::{self, ApiResponse};
use crate::service::query::QueryParams;
use crate::service::validation::{validate_object, ValidationMode};
use crate::state::AppState;

use super::{
    apply_adapter, body_object, check_access, default_discriminator, finish,
    invalidate_entity_cache, parse_json_body, persistable_columns, resolve_required, ret_override,
    run_after_hooks, run_before_hooks, shaped_row,
};

pub async fn entry(
    state: AppState,
    rt: Arc<EntityRuntime>,
    id: String,
    params: QueryParams,
    body: axum::body::Bytes,
) -> ApiResponse {
    let result = handle(&state, &rt, &id, &params, &body).await;
    finish(&rt, Operation::Put, result)
}

async fn handle(
    state: &AppState,
    rt: &EntityRuntime,
    id: &str,
    params: &QueryParams,
    body: &[u8],
) -> Result<ApiResponse, ApiError> {
    let value = parse_json_body(body)?;
    partial_update(state, rt, Operation::Put, id, params, value).await
}

/// Update pipeline shared by PUT and command-less PATCH. Absent fields
/// keep their stored values; the body cannot move the row to another
/// primary key.
pub(super) async fn partial_update(
    state: &AppState,
    rt: &EntityRuntime,
    op: Operation,
    id: &str,
    params: &QueryParams,
    body: Value,
) -> Result<ApiResponse, ApiError> {
    let raw = body.clone();
    let mut payload = body_object(body)?;
    let existing = resolve_required(state, rt, op, id, params).await?;

    let mut args = HookArgs::new(
        state.store.as_ref(),
        &state.graph,
        &rt.model,
        &rt.entity.slug,
        op,
        params,
    );
    args.id = Some(id);
    args.existing = Some(&existing);
    args.raw_payload = Some(&raw);
    check_access(rt, op, &args).await?;

    if let Some(response) = run_before_hooks(rt.entity.before_hooks(op), &args, &mut payload).await?
    {
        return Ok(response);
    }

    rt.entity.filter_payload(op, &rt.model, &mut payload);
    let mut payload = apply_adapter(rt, op, payload)?;
    default_discriminator(&rt.model, Some(&existing), &mut payload)?;

    let errors = validate_object(
        rt.schema_for(op),
        &payload,
        ValidationMode::Partial,
        state.config.allow_unknown_fields,
    );
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    payload.remove(&rt.model.primary_key);
    let pk = existing
        .get(&rt.model.primary_key)
        .cloned()
        .unwrap_or(Value::Null);
    let mut row = state
        .store
        .update(&rt.model, &pk, persistable_columns(&rt.model, &payload))
        .await?
        .ok_or_else(ApiError::not_found)?;
    invalidate_entity_cache(state, rt);

    args.payload = Some(&payload);
    if let Some(response) = run_after_hooks(rt.entity.after_hooks(op), &args, &mut row).await? {
        return Ok(response);
    }
    drop(args);

    if let Some(ret) = ret_override(state, rt, params, &row).await? {
        return Ok(response::success(ret));
    }
    let value = shaped_row(state, rt, op, params, row).await?;
    Ok(response::success(value))
}
