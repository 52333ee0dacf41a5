//! Query-string filtering, sorting, and pagination.

use serde_json::{Map, Value};

use crate::error::ApiError;
use crate::model::{FieldDescriptor, FieldType, ModelDescriptor, ModelGraph};
use crate::store::{FilterNode, FilterOp, RelationStep, ResolvedCond};
use crate::util::coerce_str_value;

/// Keys with routing/shaping meaning; everything else is a filter.
pub const RESERVED_PARAMS: &[&str] = &[
    "limit",
    "sort",
    "orderby",
    "groupby",
    "attrs",
    "rels",
    "expand",
    "offset",
    "page",
    "per_page",
    "grouprelby",
    "preserve_order",
    "count_only",
    "_ds",
    "_f",
    "_ret",
    "_id_attr",
];

/// Decoded query pairs in arrival order. Repeated keys are kept.
#[derive(Clone, Debug, Default)]
pub struct QueryParams(pub Vec<(String, String)>);

impl QueryParams {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Key/value pairs sorted and re-encoded, for cache keys.
    pub fn sorted_encoded(&self) -> String {
        let mut pairs: Vec<&(String, String)> = self.0.iter().collect();
        pairs.sort();
        pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }
}

const NULL_SPELLINGS: &[&str] = &["none", "null", ""];

fn is_null_spelling(raw: &str) -> bool {
    NULL_SPELLINGS.contains(&raw.to_ascii_lowercase().as_str())
}

fn op_symbol(op: FilterOp) -> &'static str {
    match op {
        FilterOp::Eq => "=",
        FilterOp::Ne => "!",
        FilterOp::Gt => ">",
        FilterOp::Lt => "<",
        FilterOp::Ge => ">=",
        FilterOp::Le => "<=",
        FilterOp::Contains => "~",
    }
}

fn op_from_token(token: &str) -> Option<FilterOp> {
    match token {
        "=" => Some(FilterOp::Eq),
        "!" | "!=" => Some(FilterOp::Ne),
        ">" => Some(FilterOp::Gt),
        "<" => Some(FilterOp::Lt),
        ">=" => Some(FilterOp::Ge),
        "<=" => Some(FilterOp::Le),
        "~" => Some(FilterOp::Contains),
        _ => None,
    }
}

/// Splits the operator out of a filter pair. It may trail the key
/// (`age>=` … `18`) or lead the value (`age` … `>=18`); two-character
/// operators are tried before their one-character prefixes.
fn split_operator<'v>(key: &str, value: &'v str) -> (String, FilterOp, &'v str) {
    for token in [">=", "<="] {
        if let Some(stripped) = key.strip_suffix(token) {
            return (
                stripped.to_string(),
                op_from_token(token).unwrap_or(FilterOp::Eq),
                value,
            );
        }
    }
    for token in ["~", "=", ">", "<", "!"] {
        if let Some(stripped) = key.strip_suffix(token) {
            return (
                stripped.to_string(),
                op_from_token(token).unwrap_or(FilterOp::Eq),
                value,
            );
        }
    }
    for token in [">=", "<="] {
        if let Some(rest) = value.strip_prefix(token) {
            return (
                key.to_string(),
                op_from_token(token).unwrap_or(FilterOp::Eq),
                rest,
            );
        }
    }
    for token in ["~", ">", "<", "!", "="] {
        if let Some(rest) = value.strip_prefix(token) {
            return (
                key.to_string(),
                op_from_token(token).unwrap_or(FilterOp::Eq),
                rest,
            );
        }
    }
    (key.to_string(), FilterOp::Eq, value)
}

/// Resolves a dotted path to relation steps plus the terminal field.
/// `None` when any segment is unknown.
pub fn resolve_path<'g>(
    graph: &'g ModelGraph,
    model: &'g ModelDescriptor,
    path: &[&str],
) -> Option<(Vec<RelationStep>, &'g FieldDescriptor)> {
    let (field_name, rel_segments) = path.split_last()?;
    let mut steps = Vec::new();
    let mut current = model;
    for segment in rel_segments {
        let relation = current.relation_named(segment)?;
        let target = graph.model(&relation.target)?;
        steps.push(RelationStep {
            relation: relation.clone(),
            target_table: target.table.clone(),
        });
        current = target;
    }
    let field = current.field_named(field_name)?;
    Some((steps, field))
}

fn cond_from_parts(
    steps: Vec<RelationStep>,
    field: &FieldDescriptor,
    op: FilterOp,
    raw: &str,
) -> Result<FilterNode, ApiError> {
    let value = if is_null_spelling(raw) {
        Value::Null
    } else if op == FilterOp::Contains {
        if field.field_type != FieldType::Text {
            return Err(ApiError::BadRequest(format!(
                "'~' filter needs a text column, {} is {}",
                field.name,
                field.field_type.schema_name()
            )));
        }
        Value::String(raw.to_string())
    } else {
        coerce_str_value(field.field_type, raw)
            .map_err(|e| ApiError::BadRequest(format!("filter on {}: {}", field.name, e)))?
    };
    Ok(FilterNode::Cond(ResolvedCond {
        steps,
        field: field.name.clone(),
        field_type: field.field_type,
        op,
        value,
    }))
}

/// Turns the non-reserved query pairs (plus any `_f` tree) into filter
/// nodes. Pairs that do not resolve to a known column are ignored, as
/// unknown filters always have been.
pub fn parse_filters(
    graph: &ModelGraph,
    model: &ModelDescriptor,
    params: &QueryParams,
) -> Result<Vec<FilterNode>, ApiError> {
    let mut nodes = Vec::new();
    for (key, value) in params.iter() {
        if RESERVED_PARAMS.contains(&key) {
            continue;
        }
        let (path, op, raw) = split_operator(key, value);
        let segments: Vec<&str> = path.split('.').collect();
        let Some((steps, field)) = resolve_path(graph, model, &segments) else {
            continue;
        };
        nodes.push(cond_from_parts(steps, field, op, raw)?);
    }
    for raw_tree in params.get_all("_f") {
        let value: Value = serde_json::from_str(raw_tree)
            .map_err(|e| ApiError::BadRequest(format!("_f is not valid json: {}", e)))?;
        nodes.push(tree_node(graph, model, &value, 0)?);
    }
    Ok(nodes)
}

const MAX_TREE_DEPTH: u32 = 8;

/// One node of the structured `_f` filter tree: `{"and": [...]}`,
/// `{"or": [...]}`, or a `{"field", "op", "value"}` leaf. Unlike bare
/// query pairs, unknown fields here are rejected.
fn tree_node(
    graph: &ModelGraph,
    model: &ModelDescriptor,
    value: &Value,
    depth: u32,
) -> Result<FilterNode, ApiError> {
    if depth > MAX_TREE_DEPTH {
        return Err(ApiError::BadRequest("_f tree is nested too deeply".into()));
    }
    let obj = value
        .as_object()
        .ok_or_else(|| ApiError::BadRequest("_f nodes must be objects".into()))?;
    for (combinator, build) in [
        ("and", FilterNode::And as fn(Vec<FilterNode>) -> FilterNode),
        ("or", FilterNode::Or as fn(Vec<FilterNode>) -> FilterNode),
    ] {
        if let Some(children) = obj.get(combinator) {
            let children = children.as_array().ok_or_else(|| {
                ApiError::BadRequest(format!("_f '{}' takes a list", combinator))
            })?;
            let mut nodes = Vec::with_capacity(children.len());
            for child in children {
                nodes.push(tree_node(graph, model, child, depth + 1)?);
            }
            return Ok(build(nodes));
        }
    }
    let field_path = obj
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::BadRequest("_f leaf needs a 'field'".into()))?;
    let op = match obj.get("op") {
        None => FilterOp::Eq,
        Some(Value::String(token)) => op_from_token(token)
            .ok_or_else(|| ApiError::BadRequest(format!("_f: unknown op '{}'", token)))?,
        Some(_) => return Err(ApiError::BadRequest("_f 'op' must be a string".into())),
    };
    let segments: Vec<&str> = field_path.split('.').collect();
    let (steps, field) = resolve_path(graph, model, &segments)
        .ok_or_else(|| ApiError::BadRequest(format!("_f: unknown field '{}'", field_path)))?;
    let raw_value = obj.get("value").unwrap_or(&Value::Null);
    match raw_value {
        Value::Null => Ok(FilterNode::Cond(ResolvedCond {
            steps,
            field: field.name.clone(),
            field_type: field.field_type,
            op,
            value: Value::Null,
        })),
        Value::String(s) => cond_from_parts(steps, field, op, s),
        other => Ok(FilterNode::Cond(ResolvedCond {
            steps,
            field: field.name.clone(),
            field_type: field.field_type,
            op,
            value: other.clone(),
        })),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

/// Listing knobs from the query string, after the per-operation
/// defaults are folded in.
#[derive(Clone, Debug)]
pub struct ListParams {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub page: Option<u64>,
    pub per_page: u64,
    pub sort: SortDir,
    pub order_by: Option<String>,
    pub count_only: bool,
    pub group_by: Vec<String>,
    pub preserve_order: bool,
}

/// Server-side listing defaults an Index operation can declare.
#[derive(Clone, Debug)]
pub struct IndexDefaults {
    pub limit: Option<u64>,
    pub sort: SortDir,
    pub order_by: Option<String>,
    pub per_page: u64,
}

impl Default for IndexDefaults {
    fn default() -> Self {
        Self {
            limit: None,
            sort: SortDir::Asc,
            order_by: None,
            per_page: 20,
        }
    }
}

fn parse_u64(params: &QueryParams, key: &str) -> Result<Option<u64>, ApiError> {
    match params.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("{} must be a non-negative integer", key))),
    }
}

impl ListParams {
    pub fn from_params(
        model: &ModelDescriptor,
        params: &QueryParams,
        defaults: &IndexDefaults,
    ) -> Result<Self, ApiError> {
        let sort = match params.get("sort") {
            None => defaults.sort,
            Some(raw) if raw.eq_ignore_ascii_case("asc") => SortDir::Asc,
            Some(raw) if raw.eq_ignore_ascii_case("desc") => SortDir::Desc,
            Some(raw) => {
                return Err(ApiError::BadRequest(format!(
                    "sort must be asc or desc, got '{}'",
                    raw
                )))
            }
        };
        let order_by = params
            .get("orderby")
            .map(str::to_string)
            .or_else(|| defaults.order_by.clone());
        if let Some(column) = &order_by {
            if model.field_named(column).is_none() {
                return Err(ApiError::BadRequest(format!(
                    "cannot order by unknown column '{}'",
                    column
                )));
            }
        }
        let mut group_by = Vec::new();
        for raw in params.get_all("groupby") {
            for column in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                if model.field_named(column).is_none() {
                    return Err(ApiError::BadRequest(format!(
                        "cannot group by unknown column '{}'",
                        column
                    )));
                }
                group_by.push(column.to_string());
            }
        }
        Ok(ListParams {
            limit: parse_u64(params, "limit")?.or(defaults.limit),
            offset: parse_u64(params, "offset")?,
            page: parse_u64(params, "page")?,
            per_page: parse_u64(params, "per_page")?.unwrap_or(defaults.per_page),
            sort,
            order_by,
            count_only: params
                .get("count_only")
                .and_then(crate::util::boolify)
                .unwrap_or(false),
            group_by,
            preserve_order: params
                .get("preserve_order")
                .and_then(crate::util::boolify)
                .unwrap_or(false),
        })
    }
}

/// Pagination meta carried beside a paged result.
#[derive(Clone, Debug)]
pub struct PageMeta {
    pub total_pages: u64,
    pub total_items: u64,
    pub first_item_index: u64,
    pub last_item_index: u64,
}

impl PageMeta {
    pub fn into_map(self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("total_pages".to_string(), self.total_pages.into());
        map.insert("total_items".to_string(), self.total_items.into());
        map.insert(
            "curr_page_first_item_index".to_string(),
            self.first_item_index.into(),
        );
        map.insert(
            "curr_page_last_item_index".to_string(),
            self.last_item_index.into(),
        );
        map
    }
}

/// Turns a 1-based page request into an offset, rejecting out-of-range
/// pages with the PAGE_NOT_FOUND envelope data.
pub fn paginate(total_items: u64, page: u64, per_page: u64) -> Result<(u64, PageMeta), ApiError> {
    let per_page = per_page.max(1);
    let total_pages = total_items.div_ceil(per_page);
    if page == 0 || page > total_pages.max(1) {
        return Err(ApiError::PageNotFound { total_pages });
    }
    let offset = (page - 1) * per_page;
    let first = if total_items == 0 { 0 } else { offset + 1 };
    let last = (offset + per_page).min(total_items);
    Ok((
        offset,
        PageMeta {
            total_pages,
            total_items,
            first_item_index: first,
            last_item_index: last,
        },
    ))
}
