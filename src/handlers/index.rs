//! GET collection: filters, sorting, paging, grouping, count_only.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::cache::ResponseCache;
use crate::entity::{HookArgs, Operation};
use crate::error::ApiError;
use crate::model::EntityRuntime;
use crate::response::{self, ApiResponse};
use crate::service::hydrate::expand_relations;
use crate::service::query::{parse_filters, ListParams, QueryParams, SortDir};
use crate::service::serializer::{deep_group, serialize_rows};
use crate::state::AppState;
use crate::store::StoreQuery;

use super::{check_access, effective_shape, finish};

pub async fn entry(state: AppState, rt: Arc<EntityRuntime>, params: QueryParams) -> ApiResponse {
    let result = handle(&state, &rt, &params).await;
    finish(&rt, Operation::Index, result)
}

async fn handle(
    state: &AppState,
    rt: &EntityRuntime,
    params: &QueryParams,
) -> Result<ApiResponse, ApiError> {
    let policy = rt.entity.cache_for(Operation::Index);
    let key = policy.map(|_| ResponseCache::key(&format!("/{}", rt.entity.slug), params));
    if let Some(key) = &key {
        if let Some((status, body)) = state.cache.get(key) {
            return Ok(ApiResponse::new(status, body));
        }
    }

    let response = compute(state, rt, params).await?;
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
    params: &QueryParams,
) -> Result<ApiResponse, ApiError> {
    let args = HookArgs::new(
        state.store.as_ref(),
        &state.graph,
        &rt.model,
        &rt.entity.slug,
        Operation::Index,
        params,
    );
    check_access(rt, Operation::Index, &args).await?;
    drop(args);

    let list = ListParams::from_params(&rt.model, params, &rt.entity.index.defaults)?;
    let mut query = StoreQuery {
        filter: parse_filters(&state.graph, &rt.model, params)?,
        order_by: Some(
            list.order_by
                .clone()
                .unwrap_or_else(|| rt.model.primary_key.clone()),
        ),
        descending: list.sort == SortDir::Desc,
        limit: None,
        offset: None,
    };
    if let Some(scope) = rt.entity.scope_for(Operation::Index) {
        query = scope(query);
    }

    if list.count_only {
        let count = state.store.count(&rt.model, &query.filter).await?;
        return Ok(response::success(json!(count)));
    }

    let meta = if let Some(page) = list.page {
        let total = state.store.count(&rt.model, &query.filter).await?;
        let (offset, meta) = crate::service::query::paginate(total, page, list.per_page)?;
        query.limit = Some(list.per_page);
        query.offset = Some(offset);
        Some(meta)
    } else {
        query.limit = list.limit;
        query.offset = list.offset;
        None
    };

    let mut rows = state.store.select(&rt.model, &query).await?;
    let shape = effective_shape(state, rt, Operation::Index, params)?;
    expand_relations(state.store.as_ref(), &state.graph, &rt.model, &mut rows, &shape).await?;
    let serialized = serialize_rows(&state.graph, &rt.model, &rows, &shape);

    let mut result = if list.group_by.is_empty() {
        Value::Array(serialized)
    } else {
        deep_group(serialized, &list.group_by, list.preserve_order)
    };
    if let Some(transform) = rt.entity.transform_for(Operation::Index) {
        result = transform(result);
    }

    Ok(match meta {
        Some(meta) => response::success_with_meta(result, meta.into_map()),
        None => response::success(result),
    })
}
