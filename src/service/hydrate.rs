//! Batched relation loading: one `IN` query per relation per level.

use serde_json::Value;

use crate::model::{ModelDescriptor, ModelGraph, RelationKind};
use crate::service::serializer::{RelRender, ResponseShape};
use crate::store::{DataStore, Row, StoreError};

/// Join-key normalization so integer-ish values match across rows
/// regardless of how they were stored.
pub(crate) fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 {
                    Some((f as i64).to_string())
                } else {
                    Some(f.to_string())
                }
            } else {
                None
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Attaches full related rows under each relation name the shape asks
/// for, recursing into expanded shapes. To-many relations always end
/// up as arrays, to-one as an object or null.
pub async fn expand_relations(
    store: &dyn DataStore,
    graph: &ModelGraph,
    model: &ModelDescriptor,
    rows: &mut [Row],
    shape: &ResponseShape,
) -> Result<(), StoreError> {
    if rows.is_empty() {
        return Ok(());
    }
    for (name, rel_shape) in &shape.rels {
        let Some(relation) = model.relation_named(name) else {
            continue;
        };
        let Some(target) = graph.model(&relation.target) else {
            continue;
        };

        let mut wanted: Vec<Value> = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        for row in rows.iter() {
            let local = row.get(&relation.local_column).unwrap_or(&Value::Null);
            if let Some(key) = key_of(local) {
                if !seen.contains(&key) {
                    seen.push(key);
                    wanted.push(local.clone());
                }
            }
        }

        let mut related = if wanted.is_empty() {
            Vec::new()
        } else {
            store
                .find_where_in(target, &relation.remote_column, &wanted)
                .await?
        };

        if let RelRender::Expand(nested) = &rel_shape.render {
            if !nested.rels.is_empty() {
                Box::pin(expand_relations(store, graph, target, &mut related, nested)).await?;
            }
        }

        for row in rows.iter_mut() {
            let local_key = row
                .get(&relation.local_column)
                .and_then(key_of);
            let value = match relation.kind {
                RelationKind::ToOne => local_key
                    .and_then(|key| {
                        related.iter().find(|r| {
                            r.get(&relation.remote_column).and_then(key_of).as_deref()
                                == Some(key.as_str())
                        })
                    })
                    .map(|r| Value::Object(r.clone()))
                    .unwrap_or(Value::Null),
                RelationKind::ToMany => {
                    let matches: Vec<Value> = match local_key {
                        Some(key) => related
                            .iter()
                            .filter(|r| {
                                r.get(&relation.remote_column).and_then(key_of).as_deref()
                                    == Some(key.as_str())
                            })
                            .map(|r| Value::Object(r.clone()))
                            .collect(),
                        None => Vec::new(),
                    };
                    Value::Array(matches)
                }
            };
            row.insert(name.clone(), value);
        }
    }
    Ok(())
}
