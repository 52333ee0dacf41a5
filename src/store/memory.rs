//! In-memory store used by tests and demos.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::model::{DefaultValue, FieldType, ModelDescriptor};
use crate::util::{parse_date_flex, parse_datetime_flex};

use super::{DataStore, FilterNode, FilterOp, ResolvedCond, Row, StoreError, StoreQuery};

type Collections = HashMap<String, Vec<Row>>;

/// Rows held in process memory, one collection per table. Insertion
/// order is preserved, so unsorted listings are stable.
#[derive(Default)]
pub struct MemStore {
    collections: RwLock<Collections>,
    counters: RwLock<HashMap<String, i64>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self, table: &str) -> i64 {
        let mut counters = self
            .counters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let counter = counters.entry(table.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn bump_counter(&self, table: &str, seen: i64) {
        let mut counters = self
            .counters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let counter = counters.entry(table.to_string()).or_insert(0);
        if seen > *counter {
            *counter = seen;
        }
    }

    fn apply_defaults(&self, model: &ModelDescriptor, row: &mut Row) {
        for field in &model.fields {
            if row.get(&field.name).map_or(false, |v| !v.is_null()) {
                if field.name == model.primary_key {
                    if let Some(seen) = row.get(&field.name).and_then(Value::as_i64) {
                        self.bump_counter(&model.table, seen);
                    }
                }
                continue;
            }
            let value = match &field.default {
                Some(DefaultValue::AutoIncrement) => Value::from(self.next_id(&model.table)),
                Some(DefaultValue::GeneratedUuid) => {
                    Value::String(uuid::Uuid::new_v4().to_string())
                }
                Some(DefaultValue::Now) => Value::String(Utc::now().to_rfc3339()),
                Some(DefaultValue::Literal(v)) => v.clone(),
                None => Value::Null,
            };
            row.insert(field.name.clone(), value);
        }
    }

    fn normalize(&self, model: &ModelDescriptor, row: &mut Row) {
        for field in &model.fields {
            if field.field_type != FieldType::DateTime {
                continue;
            }
            if let Some(Value::String(raw)) = row.get(&field.name) {
                if let Some(dt) = parse_datetime_flex(raw) {
                    row.insert(field.name.clone(), Value::String(dt.to_rfc3339()));
                }
            }
        }
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_typed(field_type: FieldType, a: &Value, b: &Value) -> Option<Ordering> {
    match field_type {
        FieldType::Integer | FieldType::BigInt => a.as_i64()?.partial_cmp(&b.as_i64()?),
        FieldType::Float | FieldType::Numeric => a.as_f64()?.partial_cmp(&b.as_f64()?),
        FieldType::Boolean => a.as_bool()?.partial_cmp(&b.as_bool()?),
        FieldType::Date => {
            let lhs = parse_date_flex(a.as_str()?)?;
            let rhs = parse_date_flex(b.as_str()?)?;
            Some(lhs.cmp(&rhs))
        }
        FieldType::DateTime => {
            let lhs = parse_datetime_flex(a.as_str()?)?;
            let rhs = parse_datetime_flex(b.as_str()?)?;
            Some(lhs.cmp(&rhs))
        }
        FieldType::Text | FieldType::Uuid => Some(a.as_str()?.cmp(b.as_str()?)),
        FieldType::Json(_) => (a == b).then_some(Ordering::Equal),
    }
}

fn matches_op(cond: &ResolvedCond, actual: Option<&Value>) -> bool {
    let actual = actual.unwrap_or(&Value::Null);
    if cond.value.is_null() {
        return match cond.op {
            FilterOp::Eq => actual.is_null(),
            FilterOp::Ne => !actual.is_null(),
            _ => false,
        };
    }
    if actual.is_null() {
        return false;
    }
    match cond.op {
        FilterOp::Eq => loose_eq(actual, &cond.value),
        FilterOp::Ne => !loose_eq(actual, &cond.value),
        FilterOp::Contains => match (actual.as_str(), cond.value.as_str()) {
            (Some(haystack), Some(needle)) => haystack
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            _ => false,
        },
        FilterOp::Gt | FilterOp::Lt | FilterOp::Ge | FilterOp::Le => {
            match compare_typed(cond.field_type, actual, &cond.value) {
                Some(ordering) => match cond.op {
                    FilterOp::Gt => ordering == Ordering::Greater,
                    FilterOp::Lt => ordering == Ordering::Less,
                    FilterOp::Ge => ordering != Ordering::Less,
                    FilterOp::Le => ordering != Ordering::Greater,
                    _ => false,
                },
                None => false,
            }
        }
    }
}

fn eval_cond(collections: &Collections, row: &Row, cond: &ResolvedCond) -> bool {
    if cond.steps.is_empty() {
        return matches_op(cond, row.get(&cond.field));
    }
    // Join semantics: the condition holds if any row reached through
    // the relation chain satisfies it.
    let mut current: Vec<&Row> = vec![row];
    for step in &cond.steps {
        let Some(target_rows) = collections.get(&step.target_table) else {
            return false;
        };
        let mut next = Vec::new();
        for row in current {
            let local = row.get(&step.relation.local_column).unwrap_or(&Value::Null);
            if local.is_null() {
                continue;
            }
            for candidate in target_rows {
                let remote = candidate
                    .get(&step.relation.remote_column)
                    .unwrap_or(&Value::Null);
                if !remote.is_null() && loose_eq(remote, local) {
                    next.push(candidate);
                }
            }
        }
        current = next;
        if current.is_empty() {
            return false;
        }
    }
    current
        .iter()
        .any(|related| matches_op(cond, related.get(&cond.field)))
}

fn eval_node(collections: &Collections, row: &Row, node: &FilterNode) -> bool {
    match node {
        FilterNode::Cond(cond) => eval_cond(collections, row, cond),
        FilterNode::And(children) => children.iter().all(|c| eval_node(collections, row, c)),
        FilterNode::Or(children) => children.iter().any(|c| eval_node(collections, row, c)),
    }
}

fn order_rows(model: &ModelDescriptor, rows: &mut [Row], order_by: &str, descending: bool) {
    let field_type = model
        .field_named(order_by)
        .map(|f| f.field_type)
        .unwrap_or(FieldType::Text);
    rows.sort_by(|a, b| {
        let lhs = a.get(order_by).unwrap_or(&Value::Null);
        let rhs = b.get(order_by).unwrap_or(&Value::Null);
        let ordering = match (lhs.is_null(), rhs.is_null()) {
            // Nulls sort last on ascending, like Postgres.
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => compare_typed(field_type, lhs, rhs).unwrap_or(Ordering::Equal),
        };
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

#[async_trait]
impl DataStore for MemStore {
    async fn select(
        &self,
        model: &ModelDescriptor,
        query: &StoreQuery,
    ) -> Result<Vec<Row>, StoreError> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let empty = Vec::new();
        let rows = collections.get(&model.table).unwrap_or(&empty);
        let mut matched: Vec<Row> = rows
            .iter()
            .filter(|row| query.filter.iter().all(|n| eval_node(&collections, row, n)))
            .cloned()
            .collect();
        drop(collections);

        if let Some(order_by) = &query.order_by {
            order_rows(model, &mut matched, order_by, query.descending);
        }
        let offset = query.offset.unwrap_or(0) as usize;
        let mut matched: Vec<Row> = matched.into_iter().skip(offset).collect();
        if let Some(limit) = query.limit {
            matched.truncate(limit as usize);
        }
        Ok(matched)
    }

    async fn count(
        &self,
        model: &ModelDescriptor,
        filter: &[FilterNode],
    ) -> Result<u64, StoreError> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let empty = Vec::new();
        let rows = collections.get(&model.table).unwrap_or(&empty);
        let count = rows
            .iter()
            .filter(|row| filter.iter().all(|n| eval_node(&collections, row, n)))
            .count();
        Ok(count as u64)
    }

    async fn find_by_field(
        &self,
        model: &ModelDescriptor,
        field: &str,
        value: &Value,
    ) -> Result<Option<Row>, StoreError> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(collections.get(&model.table).and_then(|rows| {
            rows.iter()
                .find(|row| {
                    row.get(field)
                        .map_or(false, |actual| !actual.is_null() && loose_eq(actual, value))
                })
                .cloned()
        }))
    }

    async fn find_where_in(
        &self,
        model: &ModelDescriptor,
        field: &str,
        values: &[Value],
    ) -> Result<Vec<Row>, StoreError> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(collections
            .get(&model.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| {
                        row.get(field).map_or(false, |actual| {
                            !actual.is_null() && values.iter().any(|v| loose_eq(actual, v))
                        })
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(&self, model: &ModelDescriptor, mut row: Row) -> Result<Row, StoreError> {
        self.apply_defaults(model, &mut row);
        self.normalize(model, &mut row);
        let pk = row.get(&model.primary_key).cloned().unwrap_or(Value::Null);
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let rows = collections.entry(model.table.clone()).or_default();
        if !pk.is_null() {
            let duplicate = rows.iter().any(|existing| {
                existing
                    .get(&model.primary_key)
                    .map_or(false, |v| loose_eq(v, &pk))
            });
            if duplicate {
                return Err(StoreError::Database(format!(
                    "duplicate key on {}: {}",
                    model.table, pk
                )));
            }
        }
        rows.push(row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        model: &ModelDescriptor,
        pk: &Value,
        mut changes: Row,
    ) -> Result<Option<Row>, StoreError> {
        changes.remove(&model.primary_key);
        self.normalize(model, &mut changes);
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(rows) = collections.get_mut(&model.table) else {
            return Ok(None);
        };
        for row in rows.iter_mut() {
            let matches = row
                .get(&model.primary_key)
                .map_or(false, |v| loose_eq(v, pk));
            if matches {
                for (key, value) in changes {
                    row.insert(key, value);
                }
                return Ok(Some(row.clone()));
            }
        }
        Ok(None)
    }

    async fn delete(
        &self,
        model: &ModelDescriptor,
        pk: &Value,
    ) -> Result<Option<Row>, StoreError> {
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(rows) = collections.get_mut(&model.table) else {
            return Ok(None);
        };
        let position = rows.iter().position(|row| {
            row.get(&model.primary_key)
                .map_or(false, |v| loose_eq(v, pk))
        });
        Ok(position.map(|i| rows.remove(i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DefaultValue, FieldDescriptor, RelationDescriptor};
    use crate::store::RelationStep;
    use serde_json::json;

    fn task_model() -> ModelDescriptor {
        ModelDescriptor::new("Task", "tasks")
            .field(FieldDescriptor::integer("id").default_value(DefaultValue::AutoIncrement))
            .field(FieldDescriptor::text("title"))
            .field(FieldDescriptor::boolean("done").default_value(DefaultValue::Literal(json!(false))))
            .field(FieldDescriptor::integer("list_id"))
            .relation(RelationDescriptor::to_one("list", "TodoList", "list_id", "id"))
    }

    fn list_model() -> ModelDescriptor {
        ModelDescriptor::new("TodoList", "todo_lists")
            .field(FieldDescriptor::integer("id").default_value(DefaultValue::AutoIncrement))
            .field(FieldDescriptor::text("name"))
    }

    fn row(value: serde_json::Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn insert_applies_defaults_and_autoincrement() {
        let store = MemStore::new();
        let model = task_model();
        let first = store.insert(&model, row(json!({"title": "a"}))).await.unwrap();
        let second = store.insert(&model, row(json!({"title": "b"}))).await.unwrap();
        assert_eq!(first["id"], 1);
        assert_eq!(second["id"], 2);
        assert_eq!(first["done"], false);
        assert!(first["list_id"].is_null());
    }

    #[tokio::test]
    async fn explicit_pk_bumps_the_counter() {
        let store = MemStore::new();
        let model = task_model();
        store
            .insert(&model, row(json!({"id": 10, "title": "seeded"})))
            .await
            .unwrap();
        let next = store.insert(&model, row(json!({"title": "after"}))).await.unwrap();
        assert_eq!(next["id"], 11);
    }

    #[tokio::test]
    async fn relation_path_filter_walks_collections() {
        let store = MemStore::new();
        let tasks = task_model();
        let lists = list_model();
        store.insert(&lists, row(json!({"name": "work"}))).await.unwrap();
        store.insert(&lists, row(json!({"name": "home"}))).await.unwrap();
        store
            .insert(&tasks, row(json!({"title": "t1", "list_id": 1})))
            .await
            .unwrap();
        store
            .insert(&tasks, row(json!({"title": "t2", "list_id": 2})))
            .await
            .unwrap();

        let cond = ResolvedCond {
            steps: vec![RelationStep {
                relation: tasks.relation_named("list").unwrap().clone(),
                target_table: "todo_lists".to_string(),
            }],
            field: "name".to_string(),
            field_type: FieldType::Text,
            op: FilterOp::Eq,
            value: json!("work"),
        };
        let query = StoreQuery::default().filtered(FilterNode::Cond(cond));
        let rows = store.select(&tasks, &query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "t1");
    }

    #[tokio::test]
    async fn null_filters_and_ordering() {
        let store = MemStore::new();
        let model = task_model();
        store.insert(&model, row(json!({"title": "b"}))).await.unwrap();
        store
            .insert(&model, row(json!({"title": "a", "list_id": 5})))
            .await
            .unwrap();

        let null_cond = FilterNode::Cond(ResolvedCond {
            steps: vec![],
            field: "list_id".to_string(),
            field_type: FieldType::Integer,
            op: FilterOp::Eq,
            value: Value::Null,
        });
        let query = StoreQuery::default().filtered(null_cond);
        let rows = store.select(&model, &query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "b");

        let sorted = store
            .select(
                &model,
                &StoreQuery {
                    order_by: Some("title".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(sorted[0]["title"], "a");
    }

    #[tokio::test]
    async fn contains_is_case_insensitive() {
        let store = MemStore::new();
        let model = task_model();
        store
            .insert(&model, row(json!({"title": "Write the Report"})))
            .await
            .unwrap();
        let cond = FilterNode::Cond(ResolvedCond {
            steps: vec![],
            field: "title".to_string(),
            field_type: FieldType::Text,
            op: FilterOp::Contains,
            value: json!("report"),
        });
        let rows = store
            .select(&model, &StoreQuery::default().filtered(cond))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn update_and_delete_return_rows() {
        let store = MemStore::new();
        let model = task_model();
        store.insert(&model, row(json!({"title": "x"}))).await.unwrap();
        let updated = store
            .update(&model, &json!(1), row(json!({"done": true})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated["done"], true);
        let gone = store.delete(&model, &json!(1)).await.unwrap();
        assert!(gone.is_some());
        assert!(store.delete(&model, &json!(1)).await.unwrap().is_none());
    }
}
