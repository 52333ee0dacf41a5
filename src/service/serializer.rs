//! Response shaping: attribute selection, relation rendering, grouping.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::ApiError;
use crate::model::{ModelDescriptor, ModelGraph, RelationKind};
use crate::service::query::QueryParams;
use crate::store::Row;

/// Scalar-attribute selection. `Explicit(vec![])` means "no scalar
/// attrs at all", which is a different thing from `Default`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum FieldSelection {
    #[default]
    Default,
    Explicit(Vec<String>),
}

#[derive(Clone, Debug)]
pub enum RelRender {
    /// One attribute of the related row(s): scalar for to-one, list
    /// for to-many.
    Pluck(String),
    /// Related row(s) as nested dict(s) with their own shape.
    Expand(ResponseShape),
}

#[derive(Clone, Debug)]
pub struct RelShape {
    pub render: RelRender,
    pub group_by: Vec<String>,
    pub preserve_order: bool,
}

impl RelShape {
    pub fn expand(shape: ResponseShape) -> Self {
        RelShape {
            render: RelRender::Expand(shape),
            group_by: Vec::new(),
            preserve_order: false,
        }
    }

    pub fn pluck(attr: impl Into<String>) -> Self {
        RelShape {
            render: RelRender::Pluck(attr.into()),
            group_by: Vec::new(),
            preserve_order: false,
        }
    }
}

/// What a serialized row looks like: which scalars, which relations,
/// rendered how.
#[derive(Clone, Debug, Default)]
pub struct ResponseShape {
    pub attrs: FieldSelection,
    pub rels: BTreeMap<String, RelShape>,
}

impl ResponseShape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attrs<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attrs = FieldSelection::Explicit(attrs.into_iter().map(Into::into).collect());
        self
    }

    pub fn without_attrs(mut self) -> Self {
        self.attrs = FieldSelection::Explicit(Vec::new());
        self
    }

    pub fn with_expanded(mut self, rel: impl Into<String>, shape: ResponseShape) -> Self {
        self.rels.insert(rel.into(), RelShape::expand(shape));
        self
    }

    pub fn with_plucked(mut self, rel: impl Into<String>, attr: impl Into<String>) -> Self {
        self.rels.insert(rel.into(), RelShape::pluck(attr));
        self
    }

    pub fn with_grouped<I, S>(mut self, rel: impl Into<String>, shape: ResponseShape, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rels.insert(
            rel.into(),
            RelShape {
                render: RelRender::Expand(shape),
                group_by: keys.into_iter().map(Into::into).collect(),
                preserve_order: false,
            },
        );
        self
    }
}

/// Per-request shaping overrides, parsed from the query string. Each
/// piece is optional so unmentioned parts keep the server shape.
#[derive(Clone, Debug, Default)]
pub struct ShapeOverride {
    /// Wholesale replacement from `_ds`.
    pub replace: Option<ResponseShape>,
    pub attrs: Option<FieldSelection>,
    pub rels: BTreeMap<String, RelShape>,
    pub clear_rels: bool,
    pub group_rel: Vec<(String, Vec<String>)>,
    pub preserve_order: bool,
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reads `attrs`, `rels`, `expand`, `grouprelby`, `preserve_order`,
/// and `_ds` from the query string. `None` when none are present.
pub fn parse_shape_override(params: &QueryParams) -> Result<Option<ShapeOverride>, ApiError> {
    let mut ov = ShapeOverride::default();
    let mut touched = false;

    if let Some(raw) = params.get("attrs") {
        touched = true;
        ov.attrs = Some(if raw.eq_ignore_ascii_case("none") {
            FieldSelection::Explicit(Vec::new())
        } else {
            FieldSelection::Explicit(split_csv(raw))
        });
    }
    if let Some(raw) = params.get("rels") {
        touched = true;
        if raw.eq_ignore_ascii_case("none") {
            ov.clear_rels = true;
        } else {
            for entry in split_csv(raw) {
                match entry.split_once(':') {
                    Some((rel, attr)) => {
                        ov.rels.insert(rel.to_string(), RelShape::pluck(attr));
                    }
                    None => {
                        ov.rels.insert(entry, RelShape::expand(ResponseShape::new()));
                    }
                }
            }
        }
    }
    if let Some(raw) = params.get("expand") {
        touched = true;
        if raw.eq_ignore_ascii_case("none") {
            ov.clear_rels = true;
        } else {
            for rel in split_csv(raw) {
                ov.rels.insert(rel, RelShape::expand(ResponseShape::new()));
            }
        }
    }
    for raw in params.get_all("grouprelby") {
        touched = true;
        let (rel, keys) = raw.split_once(':').ok_or_else(|| {
            ApiError::BadRequest("grouprelby must look like rel:attr1,attr2".into())
        })?;
        let keys = split_csv(keys);
        if keys.is_empty() {
            return Err(ApiError::BadRequest(
                "grouprelby needs at least one attribute".into(),
            ));
        }
        ov.group_rel.push((rel.to_string(), keys));
    }
    if let Some(raw) = params.get("preserve_order") {
        touched = true;
        ov.preserve_order = crate::util::boolify(raw).unwrap_or(false);
    }
    if let Some(raw) = params.get("_ds") {
        touched = true;
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ApiError::BadRequest(format!("_ds is not valid json: {}", e)))?;
        ov.replace = Some(shape_from_ds(&value, 0)?);
    }

    Ok(touched.then_some(ov))
}

const MAX_DS_DEPTH: u32 = 8;

/// `_ds` mirrors the declarative shape: `{"attrs": [...]|"none",
/// "rels": {name: <ds> | {"pluck": attr}}}`, with optional `group_by`
/// and `preserve_order` keys per relation entry.
fn shape_from_ds(value: &Value, depth: u32) -> Result<ResponseShape, ApiError> {
    if depth > MAX_DS_DEPTH {
        return Err(ApiError::BadRequest("_ds is nested too deeply".into()));
    }
    let obj = value
        .as_object()
        .ok_or_else(|| ApiError::BadRequest("_ds entries must be objects".into()))?;
    let mut shape = ResponseShape::new();
    match obj.get("attrs") {
        None => {}
        Some(Value::String(s)) if s.eq_ignore_ascii_case("none") => {
            shape.attrs = FieldSelection::Explicit(Vec::new());
        }
        Some(Value::Array(items)) => {
            let mut attrs = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(s) => attrs.push(s.to_string()),
                    None => return Err(ApiError::BadRequest("_ds attrs must be strings".into())),
                }
            }
            shape.attrs = FieldSelection::Explicit(attrs);
        }
        Some(_) => {
            return Err(ApiError::BadRequest(
                "_ds attrs must be a list or \"none\"".into(),
            ))
        }
    }
    if let Some(rels) = obj.get("rels") {
        let rels = rels
            .as_object()
            .ok_or_else(|| ApiError::BadRequest("_ds rels must be an object".into()))?;
        for (name, entry) in rels {
            let entry_obj = entry
                .as_object()
                .ok_or_else(|| ApiError::BadRequest("_ds rel entries must be objects".into()))?;
            let mut rel_shape = if let Some(attr) = entry_obj.get("pluck") {
                let attr = attr
                    .as_str()
                    .ok_or_else(|| ApiError::BadRequest("_ds pluck must be a string".into()))?;
                RelShape::pluck(attr)
            } else {
                RelShape::expand(shape_from_ds(entry, depth + 1)?)
            };
            if let Some(keys) = entry_obj.get("group_by") {
                let keys = keys
                    .as_array()
                    .ok_or_else(|| ApiError::BadRequest("_ds group_by must be a list".into()))?;
                for key in keys {
                    match key.as_str() {
                        Some(s) => rel_shape.group_by.push(s.to_string()),
                        None => {
                            return Err(ApiError::BadRequest(
                                "_ds group_by entries must be strings".into(),
                            ))
                        }
                    }
                }
            }
            if let Some(preserve) = entry_obj.get("preserve_order").and_then(Value::as_bool) {
                rel_shape.preserve_order = preserve;
            }
            shape.rels.insert(name.clone(), rel_shape);
        }
    }
    Ok(shape)
}

/// Folds a request override over the server-declared shape. `_ds`
/// replaces wholesale; otherwise attrs and per-relation entries win
/// individually, and `grouprelby` layers grouping on top.
pub fn merge_shape(server: &ResponseShape, ov: &ShapeOverride) -> ResponseShape {
    let mut merged = match &ov.replace {
        Some(replacement) => replacement.clone(),
        None => {
            let mut shape = server.clone();
            if let Some(attrs) = &ov.attrs {
                shape.attrs = attrs.clone();
            }
            if ov.clear_rels {
                shape.rels.clear();
            }
            for (name, rel_shape) in &ov.rels {
                shape.rels.insert(name.clone(), rel_shape.clone());
            }
            shape
        }
    };
    for (rel, keys) in &ov.group_rel {
        let entry = merged
            .rels
            .entry(rel.clone())
            .or_insert_with(|| RelShape::expand(ResponseShape::new()));
        entry.group_by = keys.clone();
        entry.preserve_order = ov.preserve_order;
    }
    merged
}

/// Rejects shapes that name attributes or relations the models do not
/// have, so serialization itself never has to fail.
pub fn validate_shape(
    graph: &ModelGraph,
    model: &ModelDescriptor,
    shape: &ResponseShape,
) -> Result<(), ApiError> {
    if let FieldSelection::Explicit(attrs) = &shape.attrs {
        for attr in attrs {
            if model.field_named(attr).is_none() {
                return Err(ApiError::BadRequest(format!(
                    "{} has no attribute '{}'",
                    model.name, attr
                )));
            }
        }
    }
    for (name, rel_shape) in &shape.rels {
        let Some(relation) = model.relation_named(name) else {
            return Err(ApiError::BadRequest(format!(
                "{} has no relation '{}'",
                model.name, name
            )));
        };
        let Some(target) = graph.model(&relation.target) else {
            return Err(ApiError::BadRequest(format!(
                "unknown model '{}' behind relation '{}'",
                relation.target, name
            )));
        };
        match &rel_shape.render {
            RelRender::Pluck(attr) => {
                if target.field_named(attr).is_none() {
                    return Err(ApiError::BadRequest(format!(
                        "{} has no attribute '{}'",
                        target.name, attr
                    )));
                }
            }
            RelRender::Expand(nested) => validate_shape(graph, target, nested)?,
        }
        for key in &rel_shape.group_by {
            if target.field_named(key).is_none() {
                return Err(ApiError::BadRequest(format!(
                    "cannot group '{}' by unknown attribute '{}'",
                    name, key
                )));
            }
        }
    }
    Ok(())
}

fn effective_attrs(model: &ModelDescriptor, shape: &ResponseShape) -> Vec<String> {
    match &shape.attrs {
        FieldSelection::Explicit(attrs) => attrs.clone(),
        FieldSelection::Default => match &model.default_attrs {
            Some(attrs) => attrs.clone(),
            None => model.field_names().map(str::to_string).collect(),
        },
    }
}

/// Stringifies a grouping key the way JSON object keys demand.
pub fn group_key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Groups serialized rows hierarchically by the given keys; the
/// innermost level stays a list.
pub fn deep_group(items: Vec<Value>, keys: &[String], preserve_order: bool) -> Value {
    let Some((key, rest)) = keys.split_first() else {
        return Value::Array(items);
    };
    let mut buckets: Vec<(String, Vec<Value>)> = Vec::new();
    for item in items {
        let group = group_key_string(item.get(key).unwrap_or(&Value::Null));
        match buckets.iter_mut().find(|(name, _)| *name == group) {
            Some((_, bucket)) => bucket.push(item),
            None => buckets.push((group, vec![item])),
        }
    }
    if !preserve_order {
        buckets.sort_by(|(a, _), (b, _)| a.cmp(b));
    }
    let mut out = Map::new();
    for (name, bucket) in buckets {
        out.insert(name, deep_group(bucket, rest, preserve_order));
    }
    Value::Object(out)
}

/// Projects one hydrated row through a shape. Relation values must
/// already sit in the row (full related rows); missing to-many
/// relations render as empty lists, never null.
pub fn serialize_row(
    graph: &ModelGraph,
    model: &ModelDescriptor,
    row: &Row,
    shape: &ResponseShape,
) -> Value {
    let mut out = Map::new();
    for attr in effective_attrs(model, shape) {
        out.insert(attr.clone(), row.get(&attr).cloned().unwrap_or(Value::Null));
    }
    for (name, rel_shape) in &shape.rels {
        let Some(relation) = model.relation_named(name) else {
            continue;
        };
        let Some(target) = graph.model(&relation.target) else {
            continue;
        };
        let hydrated = row.get(name);
        let rendered = match relation.kind {
            RelationKind::ToOne => {
                let related = hydrated.and_then(Value::as_object);
                match (&rel_shape.render, related) {
                    (_, None) => Value::Null,
                    (RelRender::Pluck(attr), Some(obj)) => {
                        obj.get(attr).cloned().unwrap_or(Value::Null)
                    }
                    (RelRender::Expand(nested), Some(obj)) => {
                        serialize_row(graph, target, obj, nested)
                    }
                }
            }
            RelationKind::ToMany => {
                let items: Vec<&Map<String, Value>> = hydrated
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_object).collect())
                    .unwrap_or_default();
                let rendered: Vec<Value> = match &rel_shape.render {
                    RelRender::Pluck(attr) => items
                        .iter()
                        .map(|obj| obj.get(attr).cloned().unwrap_or(Value::Null))
                        .collect(),
                    RelRender::Expand(nested) => items
                        .iter()
                        .map(|obj| serialize_row(graph, target, obj, nested))
                        .collect(),
                };
                if rel_shape.group_by.is_empty() {
                    Value::Array(rendered)
                } else {
                    deep_group(rendered, &rel_shape.group_by, rel_shape.preserve_order)
                }
            }
        };
        out.insert(name.clone(), rendered);
    }
    Value::Object(out)
}

pub fn serialize_rows(
    graph: &ModelGraph,
    model: &ModelDescriptor,
    rows: &[Row],
    shape: &ResponseShape,
) -> Vec<Value> {
    rows.iter()
        .map(|row| serialize_row(graph, model, row, shape))
        .collect()
}
