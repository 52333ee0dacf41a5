//! PATCH: named command dispatch off the body's `cmd` key, falling
//! back to a plain partial update when no command is given.

use std::sync::Arc;

use serde_json::Value;

use crate::entity::{CommandOutcome, HookArgs, Operation};
use crate::error::ApiError;
use crate::model::EntityRuntime;
use crate::response::{self, ApiResponse};
use crate::service::query::QueryParams;
use crate::state::AppState;

use super::{
    body_object, check_access, finish, invalidate_entity_cache, parse_json_body,
    persistable_columns, resolve_required, ret_override, run_after_hooks, shaped_row,
};

pub async fn entry(
    state: AppState,
    rt: Arc<EntityRuntime>,
    id: String,
    params: QueryParams,
    body: axum::body::Bytes,
) -> ApiResponse {
    let result = handle(&state, &rt, &id, &params, &body).await;
    finish(&rt, Operation::Patch, result)
}

async fn handle(
    state: &AppState,
    rt: &EntityRuntime,
    id: &str,
    params: &QueryParams,
    body: &[u8],
) -> Result<ApiResponse, ApiError> {
    let value = parse_json_body(body)?;
    let has_cmd = value
        .as_object()
        .map(|obj| obj.contains_key("cmd"))
        .unwrap_or(false);
    if !has_cmd {
        return super::put::partial_update(state, rt, Operation::Patch, id, params, value).await;
    }

    let raw = value.clone();
    let mut payload = body_object(value)?;
    let cmd_value = payload.remove("cmd").unwrap_or(Value::Null);
    let name = cmd_value
        .as_str()
        .ok_or_else(|| ApiError::BadRequest("cmd must be a string".into()))?;
    let command = rt
        .entity
        .patch
        .commands
        .get(name)
        .cloned()
        .ok_or_else(|| ApiError::BadRequest(format!("unknown patch command '{}'", name)))?;

    let existing = resolve_required(state, rt, Operation::Patch, id, params).await?;

    let mut args = HookArgs::new(
        state.store.as_ref(),
        &state.graph,
        &rt.model,
        &rt.entity.slug,
        Operation::Patch,
        params,
    );
    args.id = Some(id);
    args.existing = Some(&existing);
    args.raw_payload = Some(&raw);
    check_access(rt, Operation::Patch, &args).await?;

    match command.apply(&args, &existing, &payload).await? {
        CommandOutcome::Respond(response) => Ok(response),
        CommandOutcome::Update(mut changes) => {
            changes.remove(&rt.model.primary_key);
            let pk = existing
                .get(&rt.model.primary_key)
                .cloned()
                .unwrap_or(Value::Null);
            let mut row = state
                .store
                .update(&rt.model, &pk, persistable_columns(&rt.model, &changes))
                .await?
                .ok_or_else(ApiError::not_found)?;
            invalidate_entity_cache(state, rt);

            args.payload = Some(&changes);
            if let Some(response) =
                run_after_hooks(rt.entity.after_hooks(Operation::Patch), &args, &mut row).await?
            {
                return Ok(response);
            }
            drop(args);

            if let Some(ret) = ret_override(state, rt, params, &row).await? {
                return Ok(response::success(ret));
            }
            let value = shaped_row(state, rt, Operation::Patch, params, row).await?;
            Ok(response::success(value))
        }
    }
}
