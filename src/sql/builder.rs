//! Builds parameterized SELECT, INSERT, UPDATE, DELETE from model descriptors.

use std::collections::HashMap;

use serde_json::Value;

use crate::model::{FieldType, ModelDescriptor};
use crate::store::{FilterNode, FilterOp, ResolvedCond, Row, StoreQuery};

const MAIN_ALIAS: &str = "t0";

/// Quote identifier for PostgreSQL (safe: only from descriptors).
fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push_param(&mut self, v: Value) -> usize {
        self.params.push(v);
        self.params.len()
    }

    fn typed_placeholder(&mut self, v: Value, field_type: FieldType) -> String {
        let n = self.push_param(v);
        format!("${}::{}", n, field_type.pg_type())
    }
}

/// SELECT list: columns as-is, except numeric as col::text so sqlx
/// returns String.
fn select_column_list(model: &ModelDescriptor, alias: Option<&str>) -> String {
    model
        .fields
        .iter()
        .map(|f| {
            let q = quoted(&f.name);
            let prefixed = match alias {
                Some(a) => format!("{}.{}", a, q),
                None => q.clone(),
            };
            if f.field_type == FieldType::Numeric {
                format!("{}::text AS {}", prefixed, q)
            } else if alias.is_some() {
                format!("{} AS {}", prefixed, q)
            } else {
                prefixed
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Allocates one join alias per distinct relation path and remembers
/// the JOIN clauses in first-use order.
struct JoinSet {
    aliases: HashMap<String, String>,
    clauses: Vec<String>,
}

impl JoinSet {
    fn new() -> Self {
        Self {
            aliases: HashMap::new(),
            clauses: Vec::new(),
        }
    }

    fn alias_for(&mut self, cond: &ResolvedCond) -> String {
        let mut prev = MAIN_ALIAS.to_string();
        let mut path = String::new();
        for step in &cond.steps {
            if !path.is_empty() {
                path.push('.');
            }
            path.push_str(&step.relation.name);
            if let Some(existing) = self.aliases.get(&path) {
                prev = existing.clone();
                continue;
            }
            let alias = format!("t{}", self.aliases.len() + 1);
            self.clauses.push(format!(
                "JOIN {} {} ON {}.{} = {}.{}",
                quoted(&step.target_table),
                alias,
                prev,
                quoted(&step.relation.local_column),
                alias,
                quoted(&step.relation.remote_column)
            ));
            self.aliases.insert(path.clone(), alias.clone());
            prev = alias;
        }
        prev
    }

    fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

fn render_cond(q: &mut QueryBuf, joins: &mut JoinSet, cond: &ResolvedCond) -> String {
    let alias = joins.alias_for(cond);
    let column = format!("{}.{}", alias, quoted(&cond.field));
    if cond.value.is_null() {
        return match cond.op {
            FilterOp::Ne => format!("{} IS NOT NULL", column),
            _ => format!("{} IS NULL", column),
        };
    }
    match cond.op {
        FilterOp::Contains => {
            let needle = cond.value.as_str().unwrap_or_default();
            let n = q.push_param(Value::String(format!("%{}%", needle)));
            format!("{} ILIKE ${}", column, n)
        }
        op => {
            let ph = q.typed_placeholder(cond.value.clone(), cond.field_type);
            let sym = match op {
                FilterOp::Eq => "=",
                FilterOp::Ne => "<>",
                FilterOp::Gt => ">",
                FilterOp::Lt => "<",
                FilterOp::Ge => ">=",
                FilterOp::Le => "<=",
                FilterOp::Contains => unreachable!(),
            };
            format!("{} {} {}", column, sym, ph)
        }
    }
}

fn render_node(q: &mut QueryBuf, joins: &mut JoinSet, node: &FilterNode) -> String {
    match node {
        FilterNode::Cond(cond) => render_cond(q, joins, cond),
        FilterNode::And(children) => {
            let parts: Vec<String> = children
                .iter()
                .map(|c| render_node(q, joins, c))
                .collect();
            format!("({})", parts.join(" AND "))
        }
        FilterNode::Or(children) => {
            let parts: Vec<String> = children
                .iter()
                .map(|c| render_node(q, joins, c))
                .collect();
            format!("({})", parts.join(" OR "))
        }
    }
}

/// SELECT with a filter tree. Dotted-path conditions join through their
/// relations; joined queries select DISTINCT main-table columns so one
/// match per row comes back.
pub fn select(model: &ModelDescriptor, query: &StoreQuery) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut joins = JoinSet::new();
    let where_parts: Vec<String> = query
        .filter
        .iter()
        .map(|node| render_node(&mut q, &mut joins, node))
        .collect();

    let cols = select_column_list(model, Some(MAIN_ALIAS));
    let distinct = if joins.is_empty() { "" } else { "DISTINCT " };
    let mut sql = format!(
        "SELECT {}{} FROM {} {}",
        distinct,
        cols,
        quoted(&model.table),
        MAIN_ALIAS
    );
    for clause in &joins.clauses {
        sql.push(' ');
        sql.push_str(clause);
    }
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    let order_col = query.order_by.as_deref().unwrap_or(&model.primary_key);
    sql.push_str(&format!(
        " ORDER BY {}.{}{}",
        MAIN_ALIAS,
        quoted(order_col),
        if query.descending { " DESC" } else { "" }
    ));
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    if let Some(offset) = query.offset {
        sql.push_str(&format!(" OFFSET {}", offset));
    }
    q.sql = sql;
    q
}

/// COUNT of distinct primary keys under the same filter tree.
pub fn count(model: &ModelDescriptor, filter: &[FilterNode]) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut joins = JoinSet::new();
    let where_parts: Vec<String> = filter
        .iter()
        .map(|node| render_node(&mut q, &mut joins, node))
        .collect();
    let mut sql = format!(
        "SELECT COUNT(DISTINCT {}.{}) AS count FROM {} {}",
        MAIN_ALIAS,
        quoted(&model.primary_key),
        quoted(&model.table),
        MAIN_ALIAS
    );
    for clause in &joins.clauses {
        sql.push(' ');
        sql.push_str(clause);
    }
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    q.sql = sql;
    q
}

/// SELECT one row by an arbitrary column (primary key or an id_field
/// override). Caller checks row count.
pub fn select_by_field(model: &ModelDescriptor, field: &str) -> QueryBuf {
    let mut q = QueryBuf::new();
    let field_type = model
        .field_named(field)
        .map(|f| f.field_type)
        .unwrap_or(FieldType::Text);
    let cols = select_column_list(model, None);
    q.sql = format!(
        "SELECT {} FROM {} WHERE {} = $1::{} LIMIT 1",
        cols,
        quoted(&model.table),
        quoted(field),
        field_type.pg_type()
    );
    q
}

/// SELECT rows WHERE column IN ($1, ...), for batch-fetching related
/// rows and batched pk probes.
pub fn select_where_in(model: &ModelDescriptor, field: &str, values: &[Value]) -> QueryBuf {
    let mut q = QueryBuf::new();
    let cols = select_column_list(model, None);
    if values.is_empty() {
        q.sql = format!("SELECT {} FROM {} WHERE 1 = 0", cols, quoted(&model.table));
        return q;
    }
    let field_type = model
        .field_named(field)
        .map(|f| f.field_type)
        .unwrap_or(FieldType::Text);
    let placeholders: Vec<String> = values
        .iter()
        .map(|v| q.typed_placeholder(v.clone(), field_type))
        .collect();
    q.sql = format!(
        "SELECT {} FROM {} WHERE {} IN ({}) ORDER BY {}",
        cols,
        quoted(&model.table),
        quoted(field),
        placeholders.join(", "),
        quoted(&model.primary_key)
    );
    q
}

/// INSERT from a body row. Omits declared columns the body does not
/// provide when they carry a default, so the database fills them.
pub fn insert(model: &ModelDescriptor, row: &Row) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut cols = Vec::new();
    let mut placeholders = Vec::new();
    for field in &model.fields {
        let value = row.get(&field.name).cloned();
        if value.is_none() && field.default.is_some() {
            continue;
        }
        let value = value.unwrap_or(Value::Null);
        placeholders.push(q.typed_placeholder(value, field.field_type));
        cols.push(quoted(&field.name));
    }
    q.sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
        quoted(&model.table),
        cols.join(", "),
        placeholders.join(", "),
        select_column_list(model, None)
    );
    q
}

/// UPDATE by primary key: SET only declared columns present in the
/// changes. With nothing to set, degrades to a fetch so callers still
/// get the row back.
pub fn update(model: &ModelDescriptor, pk: &Value, changes: &Row) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut sets = Vec::new();
    for field in &model.fields {
        if field.name == model.primary_key {
            continue;
        }
        let Some(value) = changes.get(&field.name) else {
            continue;
        };
        let ph = q.typed_placeholder(value.clone(), field.field_type);
        sets.push(format!("{} = {}", quoted(&field.name), ph));
    }
    if sets.is_empty() {
        return select_by_pk(model, pk);
    }
    let pk_ph = q.typed_placeholder(pk.clone(), model.pk_type());
    q.sql = format!(
        "UPDATE {} SET {} WHERE {} = {} RETURNING {}",
        quoted(&model.table),
        sets.join(", "),
        quoted(&model.primary_key),
        pk_ph,
        select_column_list(model, None)
    );
    q
}

fn select_by_pk(model: &ModelDescriptor, pk: &Value) -> QueryBuf {
    let mut q = QueryBuf::new();
    let ph = q.typed_placeholder(pk.clone(), model.pk_type());
    q.sql = format!(
        "SELECT {} FROM {} WHERE {} = {}",
        select_column_list(model, None),
        quoted(&model.table),
        quoted(&model.primary_key),
        ph
    );
    q
}

/// DELETE by primary key, returning the removed row.
pub fn delete(model: &ModelDescriptor, pk: &Value) -> QueryBuf {
    let mut q = QueryBuf::new();
    let ph = q.typed_placeholder(pk.clone(), model.pk_type());
    q.sql = format!(
        "DELETE FROM {} WHERE {} = {} RETURNING {}",
        quoted(&model.table),
        quoted(&model.primary_key),
        ph,
        select_column_list(model, None)
    );
    q
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DefaultValue, FieldDescriptor, RelationDescriptor};
    use crate::store::RelationStep;
    use serde_json::json;

    fn model() -> ModelDescriptor {
        ModelDescriptor::new("Task", "tasks")
            .field(FieldDescriptor::integer("id").default_value(DefaultValue::AutoIncrement))
            .field(FieldDescriptor::text("title"))
            .field(FieldDescriptor::numeric("cost"))
            .field(FieldDescriptor::integer("list_id"))
            .relation(RelationDescriptor::to_one("list", "TodoList", "list_id", "id"))
    }

    fn rel_cond(op: FilterOp, value: Value) -> FilterNode {
        let m = model();
        FilterNode::Cond(ResolvedCond {
            steps: vec![RelationStep {
                relation: m.relation_named("list").unwrap().clone(),
                target_table: "todo_lists".to_string(),
            }],
            field: "name".to_string(),
            field_type: FieldType::Text,
            op,
            value,
        })
    }

    #[test]
    fn relation_filter_joins_and_dedupes() {
        let query = StoreQuery::default().filtered(rel_cond(FilterOp::Eq, json!("work")));
        let q = select(&model(), &query);
        assert!(q.sql.starts_with("SELECT DISTINCT"));
        assert!(q
            .sql
            .contains("JOIN \"todo_lists\" t1 ON t0.\"list_id\" = t1.\"id\""));
        assert!(q.sql.contains("t1.\"name\" = $1::text"));
        assert!(q.sql.contains("ORDER BY t0.\"id\""));
        assert_eq!(q.params, vec![json!("work")]);
    }

    #[test]
    fn null_and_contains_render_without_casts() {
        let m = model();
        let null_eq = FilterNode::Cond(ResolvedCond {
            steps: vec![],
            field: "list_id".to_string(),
            field_type: FieldType::Integer,
            op: FilterOp::Eq,
            value: Value::Null,
        });
        let q = select(&m, &StoreQuery::default().filtered(null_eq));
        assert!(q.sql.contains("t0.\"list_id\" IS NULL"));
        assert!(q.params.is_empty());

        let contains = FilterNode::Cond(ResolvedCond {
            steps: vec![],
            field: "title".to_string(),
            field_type: FieldType::Text,
            op: FilterOp::Contains,
            value: json!("rep"),
        });
        let q = select(&m, &StoreQuery::default().filtered(contains));
        assert!(q.sql.contains("t0.\"title\" ILIKE $1"));
        assert_eq!(q.params, vec![json!("%rep%")]);
    }

    #[test]
    fn or_tree_nests_in_parens() {
        let node = FilterNode::Or(vec![
            FilterNode::Cond(ResolvedCond {
                steps: vec![],
                field: "title".to_string(),
                field_type: FieldType::Text,
                op: FilterOp::Eq,
                value: json!("a"),
            }),
            FilterNode::Cond(ResolvedCond {
                steps: vec![],
                field: "title".to_string(),
                field_type: FieldType::Text,
                op: FilterOp::Eq,
                value: json!("b"),
            }),
        ]);
        let q = select(&model(), &StoreQuery::default().filtered(node));
        assert!(q
            .sql
            .contains("(t0.\"title\" = $1::text OR t0.\"title\" = $2::text)"));
    }

    #[test]
    fn insert_skips_absent_defaulted_columns() {
        let row = match json!({"title": "x", "list_id": 3}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let q = insert(&model(), &row);
        assert!(!q.sql.contains("\"id\""), "{}", q.sql);
        assert!(q.sql.contains("\"title\""));
        assert!(q.sql.contains("RETURNING"));
        assert!(q.sql.contains("\"cost\"::text AS \"cost\""));
        assert_eq!(q.params.len(), 3);
    }

    #[test]
    fn update_with_no_changes_degrades_to_select() {
        let q = update(&model(), &json!(7), &Row::new());
        assert!(q.sql.starts_with("SELECT"));
        assert_eq!(q.params, vec![json!(7)]);
    }

    #[test]
    fn where_in_with_no_values_matches_nothing() {
        let q = select_where_in(&model(), "id", &[]);
        assert!(q.sql.contains("WHERE 1 = 0"));
        assert!(q.params.is_empty());
    }
}
