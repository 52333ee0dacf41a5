//! Batch save: upsert a list of rows in one request, synchronously or
//! through the background job queue. Accepts a JSON array body or a
//! multipart CSV upload.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{FromRequest, Multipart, Request};
use serde_json::Value;

use crate::entity::{HookArgs, Operation};
use crate::error::ApiError;
use crate::jobs::{BatchFlags, BatchTask};
use crate::model::EntityRuntime;
use crate::response::{self, ApiResponse, ApiStatus};
use crate::service::expand_relations;
use crate::service::hydrate::key_of;
use crate::service::query::QueryParams;
use crate::service::serializer::serialize_row;
use crate::service::validation::{validate_object, ValidationMode};
use crate::state::AppState;
use crate::store::{FilterNode, Row, StoreError, StoreQuery};
use crate::util::{boolify, coerce_row_to_model_types, parse_csv, remove_empty_values};

use super::{
    apply_adapter, body_object, check_access, default_discriminator, field_type_of, finish,
    invalidate_entity_cache, parse_json_body, persistable_columns, run_after_hooks,
    run_before_hooks,
};

pub async fn entry(state: AppState, rt: Arc<EntityRuntime>, req: Request) -> ApiResponse {
    let result = handle(&state, &rt, req).await;
    finish(&rt, Operation::BatchSave, result)
}

async fn handle(
    state: &AppState,
    rt: &EntityRuntime,
    req: Request,
) -> Result<ApiResponse, ApiError> {
    let mut flags = BatchFlags {
        update_only: rt.entity.batch_save.update_only,
        create_only: rt.entity.batch_save.create_only,
        ..BatchFlags::default()
    };

    let content_type = req
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let rows = if content_type.starts_with("multipart/form-data") {
        read_multipart(rt, req, &mut flags).await?
    } else {
        let bytes = axum::body::to_bytes(req.into_body(), state.config.body_limit_bytes)
            .await
            .map_err(|e| ApiError::BadRequest(format!("could not read body: {}", e)))?;
        match parse_json_body(&bytes)? {
            Value::Array(items) => items
                .into_iter()
                .map(body_object)
                .collect::<Result<Vec<_>, _>>()?,
            _ => {
                return Err(ApiError::BadRequest(
                    "batch body must be a json array".into(),
                ))
            }
        }
    };

    if rt.entity.batch_save.run_async {
        let job = state.jobs.enqueue(&rt.entity.slug);
        state
            .batch_tx
            .send(BatchTask {
                job_id: job.id,
                slug: rt.entity.slug.clone(),
                rows,
                flags,
            })
            .map_err(|_| StoreError::Database("batch queue is not running".into()))?;
        let value =
            serde_json::to_value(&job).map_err(|e| StoreError::Database(e.to_string()))?;
        return Ok(response::success(value));
    }

    execute_batch(state, &rt.entity.slug, rows, flags).await
}

async fn read_multipart(
    rt: &EntityRuntime,
    req: Request,
    flags: &mut BatchFlags,
) -> Result<Vec<Row>, ApiError> {
    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {}", e)))?;
    let mut rows = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        let text = field
            .text()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        match name.as_str() {
            "file" => rows = Some(rows_from_csv(rt, &text)?),
            "update_only" => flags.update_only = boolify(&text).unwrap_or(flags.update_only),
            "create_only" => flags.create_only = boolify(&text).unwrap_or(flags.create_only),
            "skip_pre_processors" => {
                flags.skip_before_hooks = boolify(&text).unwrap_or(flags.skip_before_hooks)
            }
            "skip_post_processors" => {
                flags.skip_after_hooks = boolify(&text).unwrap_or(flags.skip_after_hooks)
            }
            _ => {}
        }
    }
    rows.ok_or_else(|| ApiError::BadRequest("multipart upload needs a 'file' field".into()))
}

/// Empty CSV cells mean "leave unset", and remaining cells are coerced
/// to the declared column types before entering the row pipeline.
fn rows_from_csv(rt: &EntityRuntime, text: &str) -> Result<Vec<Row>, ApiError> {
    let parsed = parse_csv(text).map_err(ApiError::BadRequest)?;
    let mut rows = Vec::with_capacity(parsed.len());
    for (i, mut row) in parsed.into_iter().enumerate() {
        remove_empty_values(&mut row);
        coerce_row_to_model_types(&rt.model, &mut row)
            .map_err(|e| ApiError::BadRequest(format!("row {}: {}", i + 1, e)))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Row pipeline shared by the synchronous route and the queue worker.
/// One row's failure never poisons the others; the envelope status
/// aggregates the per-row outcomes.
pub(crate) async fn execute_batch(
    state: &AppState,
    slug: &str,
    mut rows: Vec<Row>,
    flags: BatchFlags,
) -> Result<ApiResponse, ApiError> {
    let rt = state.runtime(slug)?;
    let params = QueryParams::default();

    let args = HookArgs::new(
        state.store.as_ref(),
        &state.graph,
        &rt.model,
        &rt.entity.slug,
        Operation::BatchSave,
        &params,
    );
    check_access(&rt, Operation::BatchSave, &args).await?;
    drop(args);

    // Non-settable fields come off before rows are matched, so a
    // forbidden primary key also stops pk-based matching.
    for row in &mut rows {
        rt.entity
            .filter_payload(Operation::BatchSave, &rt.model, row);
    }

    let pk = rt.model.primary_key.clone();
    let mut existing_by_key: HashMap<String, Row> = HashMap::new();
    let pk_values: Vec<Value> = rows
        .iter()
        .filter_map(|row| row.get(&pk))
        .filter(|value| !value.is_null())
        .cloned()
        .collect();
    if !pk_values.is_empty() {
        for row in state.store.find_where_in(&rt.model, &pk, &pk_values).await? {
            if let Some(key) = row.get(&pk).and_then(key_of) {
                existing_by_key.insert(key, row);
            }
        }
    }

    let mut outcomes = Vec::with_capacity(rows.len());
    let mut statuses = Vec::with_capacity(rows.len());
    for row in rows {
        let raw = Value::Object(row.clone());
        let prefetched = row
            .get(&pk)
            .and_then(key_of)
            .and_then(|key| existing_by_key.get(&key).cloned());
        let item = match save_row(state, &rt, &params, flags, row, prefetched, &raw).await {
            Ok(item) => {
                statuses.push(response::item_is_success(&item));
                item
            }
            Err(err) => {
                statuses.push(false);
                response::item_failure(err.error_value())
            }
        };
        outcomes.push(response::item_with_input(item, &raw));
    }

    if statuses.iter().any(|ok| *ok) {
        invalidate_entity_cache(state, &rt);
    }
    Ok(response::with_status(
        ApiStatus::aggregate(statuses),
        Value::Array(outcomes),
    ))
}

/// Saves one batch row, updating when a matching row exists and
/// creating otherwise. Returns the per-row item value without the
/// `input` echo.
async fn save_row(
    state: &AppState,
    rt: &EntityRuntime,
    params: &QueryParams,
    flags: BatchFlags,
    mut payload: Row,
    prefetched: Option<Row>,
    raw: &Value,
) -> Result<Value, ApiError> {
    let pk = &rt.model.primary_key;
    let mut existing = prefetched;
    if existing.is_none() && !rt.entity.batch_save.unique_identifier_fields.is_empty() {
        existing = probe_unique(state, rt, &mut payload).await?;
    }

    if existing.is_some() && flags.create_only {
        return Err(ApiError::AccessDenied(
            "Cannot create a new instance as a matching instance is existing".into(),
        ));
    }
    if existing.is_none() && flags.update_only {
        return Err(ApiError::NotFound("No matching instance found".into()));
    }

    let op = if existing.is_some() {
        Operation::Put
    } else {
        Operation::Post
    };

    let mut args = HookArgs::new(
        state.store.as_ref(),
        &state.graph,
        &rt.model,
        &rt.entity.slug,
        Operation::BatchSave,
        params,
    );
    args.raw_payload = Some(raw);
    if let Some(target) = &existing {
        args.existing = Some(target);
        check_access(rt, Operation::BatchSave, &args).await?;
    }

    if !flags.skip_before_hooks {
        if let Some(response) =
            run_before_hooks(rt.entity.before_hooks(op), &args, &mut payload).await?
        {
            return Ok(response.body);
        }
    }

    let mut payload = apply_adapter(rt, op, payload)?;
    default_discriminator(&rt.model, existing.as_ref(), &mut payload)?;

    let errors = validate_object(
        rt.schema_for(Operation::BatchSave),
        &payload,
        ValidationMode::Partial,
        state.config.allow_unknown_fields,
    );
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let saved = match &existing {
        Some(target) => {
            let pk_value = target.get(pk).cloned().unwrap_or(Value::Null);
            let mut changes = persistable_columns(&rt.model, &payload);
            changes.remove(pk);
            state
                .store
                .update(&rt.model, &pk_value, changes)
                .await?
                .ok_or_else(ApiError::not_found)?
        }
        None => {
            state
                .store
                .insert(&rt.model, persistable_columns(&rt.model, &payload))
                .await?
        }
    };

    let mut row = saved;
    if !flags.skip_after_hooks {
        args.payload = Some(&payload);
        if let Some(response) = run_after_hooks(rt.entity.after_hooks(op), &args, &mut row).await? {
            return Ok(response.body);
        }
    }
    drop(args);

    let shape = rt.entity.shape_for(Operation::BatchSave);
    let mut shaped = vec![row];
    expand_relations(state.store.as_ref(), &state.graph, &rt.model, &mut shaped, &shape).await?;
    let mut value = serialize_row(&state.graph, &rt.model, &shaped[0], &shape);
    if let Some(transform) = rt.entity.transform_for(Operation::BatchSave) {
        value = transform(value);
    }
    Ok(response::item_success(value))
}

/// Matches a row to an existing one through the configured alternate
/// key. Every field must be present and non-null; on a hit the matched
/// primary key is written back into the payload.
async fn probe_unique(
    state: &AppState,
    rt: &EntityRuntime,
    payload: &mut Row,
) -> Result<Option<Row>, ApiError> {
    let fields = &rt.entity.batch_save.unique_identifier_fields;
    let mut filter = Vec::with_capacity(fields.len());
    for field in fields {
        match payload.get(field) {
            Some(value) if !value.is_null() => {
                filter.push(FilterNode::eq(
                    field.clone(),
                    field_type_of(&rt.model, field),
                    value.clone(),
                ));
            }
            _ => return Ok(None),
        }
    }
    let mut query = StoreQuery::default();
    query.filter = filter;
    query.limit = Some(1);
    let mut found = state.store.select(&rt.model, &query).await?;
    let Some(matched) = found.pop() else {
        return Ok(None);
    };
    if let Some(id) = matched.get(&rt.model.primary_key) {
        payload.insert(rt.model.primary_key.clone(), id.clone());
    }
    Ok(Some(matched))
}
