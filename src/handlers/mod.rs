//! Per-verb CRUD handlers plus the pipeline pieces they share.

pub mod batch_save;
pub mod delete;
pub mod get;
pub mod index;
pub mod patch;
pub mod post;
pub mod put;

use std::sync::Arc;

use serde_json::Value;

use crate::entity::{Access, AfterHook, BeforeHook, HookArgs, HookFlow, Operation};
use crate::error::{ApiError, ValidationErrors};
use crate::model::{EntityRuntime, FieldType, ModelDescriptor, RelationKind};
use crate::response::ApiResponse;
use crate::service::hydrate::expand_relations;
use crate::service::query::QueryParams;
use crate::service::serializer::{
    merge_shape, parse_shape_override, serialize_row, serialize_rows, validate_shape,
    ResponseShape,
};
use crate::state::AppState;
use crate::store::{FilterNode, Row, StoreQuery};
use crate::util::coerce_str_value;

/// Applies the operation's error mapper (falling back to the entity's)
/// and folds the outcome into an envelope. Every route ends here, so
/// raw errors never leak.
pub(crate) fn finish(
    rt: &EntityRuntime,
    op: Operation,
    result: Result<ApiResponse, ApiError>,
) -> ApiResponse {
    match result {
        Ok(response) => response,
        Err(err) => {
            let mapper = rt
                .entity
                .op_common(op)
                .error_mapper
                .as_ref()
                .or(rt.entity.error_mapper.as_ref());
            let err = match mapper {
                Some(mapper) => mapper(err),
                None => err,
            };
            err.envelope()
        }
    }
}

pub(crate) fn parse_json_body(bytes: &[u8]) -> Result<Value, ApiError> {
    serde_json::from_slice(bytes)
        .map_err(|e| ApiError::BadRequest(format!("invalid json body: {}", e)))
}

pub(crate) fn body_object(value: Value) -> Result<Row, ApiError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ApiError::BadRequest("body must be a json object".into())),
    }
}

pub(crate) async fn check_access(
    rt: &EntityRuntime,
    op: Operation,
    args: &HookArgs<'_>,
) -> Result<(), ApiError> {
    if let Some(checker) = rt.entity.access_for(op) {
        match checker.check(args).await? {
            Access::Granted => {}
            Access::Denied(message) => return Err(ApiError::AccessDenied(message)),
        }
    }
    Ok(())
}

/// Scope-aware single-row lookup by the resolved id column. A value
/// that cannot coerce to the column type matches nothing.
pub(crate) async fn fetch_by_lookup(
    state: &AppState,
    rt: &EntityRuntime,
    op: Operation,
    id: &str,
    params: &QueryParams,
) -> Result<Option<Row>, ApiError> {
    let field = rt.lookup_field(params)?;
    let field_type = rt
        .model
        .field_named(&field)
        .map(|f| f.field_type)
        .unwrap_or_else(|| rt.model.pk_type());
    let value = match coerce_str_value(field_type, id) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    let mut query = StoreQuery::default()
        .filtered(FilterNode::eq(field, field_type, value));
    query.limit = Some(1);
    if let Some(scope) = rt.entity.scope_for(op) {
        query = scope(query);
    }
    let mut rows = state.store.select(&rt.model, &query).await?;
    Ok(rows.pop())
}

pub(crate) async fn resolve_required(
    state: &AppState,
    rt: &EntityRuntime,
    op: Operation,
    id: &str,
    params: &QueryParams,
) -> Result<Row, ApiError> {
    fetch_by_lookup(state, rt, op, id, params)
        .await?
        .ok_or_else(ApiError::not_found)
}

/// Server shape for the verb, folded with any request override and
/// checked against the graph.
pub(crate) fn effective_shape(
    state: &AppState,
    rt: &EntityRuntime,
    op: Operation,
    params: &QueryParams,
) -> Result<ResponseShape, ApiError> {
    let server = rt.entity.shape_for(op);
    let shape = match parse_shape_override(params)? {
        Some(ov) => merge_shape(&server, &ov),
        None => server,
    };
    validate_shape(&state.graph, &rt.model, &shape)?;
    Ok(shape)
}

pub(crate) async fn shaped_row(
    state: &AppState,
    rt: &EntityRuntime,
    op: Operation,
    params: &QueryParams,
    row: Row,
) -> Result<Value, ApiError> {
    let shape = effective_shape(state, rt, op, params)?;
    let mut rows = vec![row];
    expand_relations(state.store.as_ref(), &state.graph, &rt.model, &mut rows, &shape).await?;
    let mut value = serialize_row(&state.graph, &rt.model, &rows[0], &shape);
    if let Some(transform) = rt.entity.transform_for(op) {
        value = transform(value);
    }
    Ok(value)
}

pub(crate) fn apply_adapter(
    rt: &EntityRuntime,
    op: Operation,
    payload: Row,
) -> Result<Row, ApiError> {
    match rt.entity.adapter_for(op) {
        Some(adapter) => body_object(adapter(Value::Object(payload))?),
        None => Ok(payload),
    }
}

pub(crate) async fn run_before_hooks(
    hooks: &[Arc<dyn BeforeHook>],
    args: &HookArgs<'_>,
    payload: &mut Row,
) -> Result<Option<ApiResponse>, ApiError> {
    for hook in hooks {
        if let HookFlow::Respond(response) = hook.run(args, payload).await? {
            return Ok(Some(response));
        }
    }
    Ok(None)
}

pub(crate) async fn run_after_hooks(
    hooks: &[Arc<dyn AfterHook>],
    args: &HookArgs<'_>,
    row: &mut Row,
) -> Result<Option<ApiResponse>, ApiError> {
    for hook in hooks {
        if let HookFlow::Respond(response) = hook.run(args, row).await? {
            return Ok(Some(response));
        }
    }
    Ok(None)
}

/// Fills a missing polymorphic discriminator from the existing row;
/// a create with none to copy is a validation failure.
pub(crate) fn default_discriminator(
    model: &ModelDescriptor,
    existing: Option<&Row>,
    payload: &mut Row,
) -> Result<(), ApiError> {
    let Some(spec) = &model.polymorphic else {
        return Ok(());
    };
    if payload.contains_key(&spec.discriminator) {
        return Ok(());
    }
    match existing.and_then(|row| row.get(&spec.discriminator)) {
        Some(value) => {
            payload.insert(spec.discriminator.clone(), value.clone());
            Ok(())
        }
        None => {
            let mut errors = ValidationErrors::new();
            errors.add(&spec.discriminator, "is required");
            Err(ApiError::Validation(errors))
        }
    }
}

/// Store writes carry declared columns only; relation payloads and
/// stray keys stop at the validation layer.
pub(crate) fn persistable_columns(model: &ModelDescriptor, payload: &Row) -> Row {
    payload
        .iter()
        .filter(|(key, _)| model.field_named(key).is_some())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

pub(crate) fn invalidate_entity_cache(state: &AppState, rt: &EntityRuntime) {
    state
        .cache
        .invalidate_prefix(&format!("/{}", rt.entity.slug));
}

pub(crate) enum RetValue {
    One(Option<Row>),
    Many(Vec<Row>),
}

/// Walks a dotted `_ret` relation path off a row. Intermediate steps
/// must be to-one; the final step may fan out.
pub(crate) async fn resolve_ret(
    state: &AppState,
    model: &Arc<ModelDescriptor>,
    row: &Row,
    path: &str,
) -> Result<(Arc<ModelDescriptor>, RetValue), ApiError> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(ApiError::BadRequest("_ret needs a relation path".into()));
    }
    let mut current_model = model.clone();
    let mut current_row = Some(row.clone());
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        let Some(source) = current_row else {
            return Ok((current_model, RetValue::One(None)));
        };
        let relation = current_model
            .relation_named(segment)
            .ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "{} has no relation '{}'",
                    current_model.name, segment
                ))
            })?
            .clone();
        let target = state
            .graph
            .require(&relation.target)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?
            .clone();
        let local = source.get(&relation.local_column).cloned().unwrap_or(Value::Null);
        match relation.kind {
            RelationKind::ToOne => {
                let related = if local.is_null() {
                    None
                } else {
                    state
                        .store
                        .find_by_field(&target, &relation.remote_column, &local)
                        .await?
                };
                current_model = target;
                current_row = related;
            }
            RelationKind::ToMany => {
                if !last {
                    return Err(ApiError::BadRequest(format!(
                        "_ret cannot traverse through list relation '{}'",
                        segment
                    )));
                }
                let related = if local.is_null() {
                    Vec::new()
                } else {
                    state
                        .store
                        .find_where_in(&target, &relation.remote_column, &[local])
                        .await?
                };
                return Ok((target, RetValue::Many(related)));
            }
        }
    }
    Ok((current_model, RetValue::One(current_row)))
}

/// Renders a `_ret` target with the entity shape registered for its
/// model, falling back to the default shape.
pub(crate) async fn render_ret(
    state: &AppState,
    target: &Arc<ModelDescriptor>,
    value: RetValue,
) -> Result<Value, ApiError> {
    let shape = state
        .runtime_for_model(&target.name)
        .map(|rt| rt.entity.shape_for(Operation::Get))
        .unwrap_or_default();
    validate_shape(&state.graph, target, &shape)?;
    match value {
        RetValue::One(None) => Ok(Value::Null),
        RetValue::One(Some(row)) => {
            let mut rows = vec![row];
            expand_relations(state.store.as_ref(), &state.graph, target, &mut rows, &shape)
                .await?;
            Ok(serialize_row(&state.graph, target, &rows[0], &shape))
        }
        RetValue::Many(mut rows) => {
            expand_relations(state.store.as_ref(), &state.graph, target, &mut rows, &shape)
                .await?;
            Ok(Value::Array(serialize_rows(&state.graph, target, &rows, &shape)))
        }
    }
}

/// `_ret` after a write: walk from the written row and render the
/// related object instead of the row itself.
pub(crate) async fn ret_override(
    state: &AppState,
    rt: &EntityRuntime,
    params: &QueryParams,
    row: &Row,
) -> Result<Option<Value>, ApiError> {
    let Some(path) = params.get("_ret") else {
        return Ok(None);
    };
    let (target, value) = resolve_ret(state, &rt.model, row, path).await?;
    Ok(Some(render_ret(state, &target, value).await?))
}

/// Stringifies an id the way it appears as a multi-id response key.
pub(crate) fn id_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn field_type_of(model: &ModelDescriptor, field: &str) -> FieldType {
    model
        .field_named(field)
        .map(|f| f.field_type)
        .unwrap_or(FieldType::Text)
}
