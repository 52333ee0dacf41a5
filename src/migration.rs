//! Schema bootstrap from the model graph: CREATE TABLE per model,
//! foreign keys added once every table exists.

use sqlx::PgPool;

use crate::model::{DefaultValue, FieldDescriptor, FieldType, ModelGraph, RelationKind};
use crate::store::StoreError;

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn literal_sql(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Null => "NULL".to_string(),
        other => format!("'{}'::jsonb", other.to_string().replace('\'', "''")),
    }
}

fn column_def(field: &FieldDescriptor, is_pk: bool) -> String {
    let type_sql = match (&field.default, field.field_type) {
        (Some(DefaultValue::AutoIncrement), FieldType::BigInt) => "bigserial",
        (Some(DefaultValue::AutoIncrement), _) => "serial",
        _ => field.field_type.pg_type(),
    };
    let mut def = format!("{} {}", quote(&field.name), type_sql);
    if is_pk {
        def.push_str(" PRIMARY KEY");
    } else if !field.nullable {
        def.push_str(" NOT NULL");
    }
    match &field.default {
        None | Some(DefaultValue::AutoIncrement) => {}
        Some(DefaultValue::GeneratedUuid) => def.push_str(" DEFAULT gen_random_uuid()"),
        Some(DefaultValue::Now) => def.push_str(" DEFAULT now()"),
        Some(DefaultValue::Literal(value)) => {
            def.push_str(" DEFAULT ");
            def.push_str(&literal_sql(value));
        }
    }
    def
}

/// Creates a table for every model in the graph. Idempotent for
/// tables (IF NOT EXISTS); foreign keys are attempted afterwards and
/// already-present constraints are left alone.
pub async fn apply_migrations(pool: &PgPool, graph: &ModelGraph) -> Result<(), StoreError> {
    for model in graph.models() {
        let defs: Vec<String> = model
            .fields
            .iter()
            .map(|field| column_def(field, field.name == model.primary_key))
            .collect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
            quote(&model.table),
            defs.join(",\n  ")
        );
        tracing::debug!(table = %model.table, "create table");
        sqlx::query(&sql)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
    }

    for model in graph.models() {
        for relation in &model.relations {
            if relation.kind != RelationKind::ToOne {
                continue;
            }
            if model.field_named(&relation.local_column).is_none() {
                continue;
            }
            let Ok(target) = graph.require(&relation.target) else {
                continue;
            };
            let constraint = format!("fk_{}_{}", model.table, relation.local_column);
            let sql = format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                quote(&model.table),
                quote(&constraint),
                quote(&relation.local_column),
                quote(&target.table),
                quote(&relation.remote_column)
            );
            // Re-running against an existing constraint fails; that is
            // the idempotent case.
            let _ = sqlx::query(&sql).execute(pool).await;
        }
    }

    Ok(())
}
