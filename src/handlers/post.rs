//! POST: create one row, or each element of an array body.

use std::sync::Arc;

use serde_json::Value;

use crate::entity::{HookArgs, Operation};
use crate::error::ApiError;
use crate::model::EntityRuntime;
use crate::response::{self, ApiResponse, ApiStatus};
use crate::service::query::QueryParams;
use crate::service::validation::{validate_object, ValidationMode};
use crate::state::AppState;

use super::{
    apply_adapter, body_object, check_access, default_discriminator, finish,
    invalidate_entity_cache, parse_json_body, persistable_columns, ret_override, run_after_hooks,
    run_before_hooks, shaped_row,
};

pub async fn entry(
    state: AppState,
    rt: Arc<EntityRuntime>,
    params: QueryParams,
    body: axum::body::Bytes,
) -> ApiResponse {
    let result = handle(&state, &rt, &params, &body).await;
    finish(&rt, Operation::Post, result)
}

async fn handle(
    state: &AppState,
    rt: &EntityRuntime,
    params: &QueryParams,
    body: &[u8],
) -> Result<ApiResponse, ApiError> {
    let args = HookArgs::new(
        state.store.as_ref(),
        &state.graph,
        &rt.model,
        &rt.entity.slug,
        Operation::Post,
        params,
    );
    check_access(rt, Operation::Post, &args).await?;
    drop(args);

    match parse_json_body(body)? {
        Value::Array(items) => {
            let mut outcomes = Vec::with_capacity(items.len());
            let mut statuses = Vec::with_capacity(items.len());
            for item in items {
                match create_one(state, rt, params, item).await {
                    Ok(CreateOutcome::Row(value)) => {
                        statuses.push(true);
                        outcomes.push(response::item_success(value));
                    }
                    Ok(CreateOutcome::Response(response)) => {
                        statuses.push(response.status.is_success());
                        outcomes.push(response.body);
                    }
                    Err(err) => {
                        statuses.push(false);
                        outcomes.push(response::item_failure(err.error_value()));
                    }
                }
            }
            if statuses.iter().any(|ok| *ok) {
                invalidate_entity_cache(state, rt);
            }
            Ok(response::with_status(
                ApiStatus::aggregate(statuses),
                Value::Array(outcomes),
            ))
        }
        single => match create_one(state, rt, params, single).await? {
            CreateOutcome::Row(value) => {
                invalidate_entity_cache(state, rt);
                Ok(response::success(value))
            }
            CreateOutcome::Response(response) => {
                invalidate_entity_cache(state, rt);
                Ok(response)
            }
        },
    }
}

enum CreateOutcome {
    /// Serialized new row (or the `_ret` target in its place).
    Row(Value),
    /// A hook answered for us.
    Response(ApiResponse),
}

async fn create_one(
    state: &AppState,
    rt: &EntityRuntime,
    params: &QueryParams,
    item: Value,
) -> Result<CreateOutcome, ApiError> {
    let raw = item.clone();
    let mut payload = body_object(item)?;

    let mut args = HookArgs::new(
        state.store.as_ref(),
        &state.graph,
        &rt.model,
        &rt.entity.slug,
        Operation::Post,
        params,
    );
    args.raw_payload = Some(&raw);
    if let Some(response) =
        run_before_hooks(rt.entity.before_hooks(Operation::Post), &args, &mut payload).await?
    {
        return Ok(CreateOutcome::Response(response));
    }

    rt.entity
        .filter_payload(Operation::Post, &rt.model, &mut payload);
    let mut payload = apply_adapter(rt, Operation::Post, payload)?;
    default_discriminator(&rt.model, None, &mut payload)?;

    let errors = validate_object(
        rt.schema_for(Operation::Post),
        &payload,
        ValidationMode::Full,
        state.config.allow_unknown_fields,
    );
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let mut row = state
        .store
        .insert(&rt.model, persistable_columns(&rt.model, &payload))
        .await?;

    args.payload = Some(&payload);
    if let Some(response) =
        run_after_hooks(rt.entity.after_hooks(Operation::Post), &args, &mut row).await?
    {
        return Ok(CreateOutcome::Response(response));
    }
    drop(args);

    if let Some(ret) = ret_override(state, rt, params, &row).await? {
        return Ok(CreateOutcome::Row(ret));
    }
    let value = shaped_row(state, rt, Operation::Post, params, row).await?;
    Ok(CreateOutcome::Row(value))
}
