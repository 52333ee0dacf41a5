//! PostgreSQL store: executes the SQL builder's output via sqlx.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{ConnectOptions, PgPool, Postgres, Row as SqlxRow};
use std::str::FromStr;

use crate::model::ModelDescriptor;
use crate::sql::{self, PgBindValue, QueryBuf};

use super::{DataStore, FilterNode, Row, StoreError, StoreQuery};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_all(&self, q: &QueryBuf) -> Result<Vec<Row>, StoreError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let mut query = sqlx::query(&q.sql);
        for p in &q.params {
            query = query.bind(PgBindValue::from_json(p));
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(rows.iter().map(row_to_map).collect())
    }

    async fn fetch_optional(&self, q: &QueryBuf) -> Result<Option<Row>, StoreError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let mut query = sqlx::query(&q.sql);
        for p in &q.params {
            query = query.bind(PgBindValue::from_json(p));
        }
        let row = query.fetch_optional(&self.pool).await.map_err(db_err)?;
        Ok(row.as_ref().map(row_to_map))
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

#[async_trait]
impl DataStore for PgStore {
    async fn select(
        &self,
        model: &ModelDescriptor,
        query: &StoreQuery,
    ) -> Result<Vec<Row>, StoreError> {
        self.fetch_all(&sql::select(model, query)).await
    }

    async fn count(
        &self,
        model: &ModelDescriptor,
        filter: &[FilterNode],
    ) -> Result<u64, StoreError> {
        let q = sql::count(model, filter);
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let mut query = sqlx::query(&q.sql);
        for p in &q.params {
            query = query.bind(PgBindValue::from_json(p));
        }
        let row = query.fetch_one(&self.pool).await.map_err(db_err)?;
        let count: i64 = row.try_get("count").map_err(db_err)?;
        Ok(count.max(0) as u64)
    }

    async fn find_by_field(
        &self,
        model: &ModelDescriptor,
        field: &str,
        value: &Value,
    ) -> Result<Option<Row>, StoreError> {
        if model.field_named(field).is_none() {
            return Err(StoreError::UnknownColumn(field.to_string()));
        }
        let mut q = sql::select_by_field(model, field);
        q.params.push(value.clone());
        self.fetch_optional(&q).await
    }

    async fn find_where_in(
        &self,
        model: &ModelDescriptor,
        field: &str,
        values: &[Value],
    ) -> Result<Vec<Row>, StoreError> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch_all(&sql::select_where_in(model, field, values))
            .await
    }

    async fn insert(&self, model: &ModelDescriptor, row: Row) -> Result<Row, StoreError> {
        let q = sql::insert(model, &row);
        self.fetch_optional(&q)
            .await?
            .ok_or_else(|| StoreError::Database("insert returned no row".to_string()))
    }

    async fn update(
        &self,
        model: &ModelDescriptor,
        pk: &Value,
        changes: Row,
    ) -> Result<Option<Row>, StoreError> {
        self.fetch_optional(&sql::update(model, pk, &changes)).await
    }

    async fn delete(
        &self,
        model: &ModelDescriptor,
        pk: &Value,
    ) -> Result<Option<Row>, StoreError> {
        self.fetch_optional(&sql::delete(model, pk)).await
    }
}

fn probe<'r, T>(row: &'r PgRow, name: &str) -> Option<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get::<Option<T>, _>(name).ok().flatten()
}

fn cell_to_value(row: &PgRow, name: &str) -> Value {
    if let Some(n) = probe::<i16>(row, name) {
        return Value::Number(n.into());
    }
    if let Some(n) = probe::<i32>(row, name) {
        return Value::Number(n.into());
    }
    if let Some(n) = probe::<i64>(row, name) {
        return Value::Number(n.into());
    }
    if let Some(n) = probe::<f32>(row, name) {
        if let Some(n) = serde_json::Number::from_f64(n as f64) {
            return Value::Number(n);
        }
    }
    if let Some(n) = probe::<f64>(row, name) {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    if let Some(b) = probe::<bool>(row, name) {
        return Value::Bool(b);
    }
    if let Some(u) = probe::<uuid::Uuid>(row, name) {
        return Value::String(u.to_string());
    }
    if let Some(d) = probe::<chrono::DateTime<chrono::Utc>>(row, name) {
        return Value::String(d.to_rfc3339());
    }
    if let Some(d) = probe::<chrono::NaiveDateTime>(row, name) {
        return Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Some(d) = probe::<chrono::NaiveDate>(row, name) {
        return Value::String(d.format("%Y-%m-%d").to_string());
    }
    if let Some(s) = probe::<String>(row, name) {
        return Value::String(s);
    }
    if let Some(j) = probe::<Value>(row, name) {
        return j;
    }
    Value::Null
}

fn row_to_map(row: &PgRow) -> Row {
    use sqlx::Column;
    let mut map = Row::new();
    for col in row.columns() {
        let name = col.name();
        map.insert(name.to_string(), cell_to_value(row, name));
    }
    map
}

/// Connects to the admin database and creates the target database when
/// it does not exist yet. No-op for the default `postgres` database.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), StoreError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| StoreError::Database(format!("invalid DATABASE_URL: {}", e)))?;
    let mut conn: sqlx::PgConnection = opts.connect().await.map_err(db_err)?;
    let exists: (bool,) =
        sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(&db_name)
            .fetch_one(&mut conn)
            .await
            .map_err(db_err)?;
    if !exists.0 {
        let quoted = quote_ident(&db_name);
        sqlx::query(&format!("CREATE DATABASE {}", quoted))
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
    }
    Ok(())
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), StoreError> {
    let path_start = url
        .rfind('/')
        .ok_or_else(|| StoreError::Database("DATABASE_URL: no path".into()))?
        + 1;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let db_name = path_and_query.split('?').next().unwrap_or("").trim();
    let base = url.get(..path_start).unwrap_or(url);
    let admin_url = format!("{}postgres", base);
    Ok((admin_url, db_name.to_string()))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
