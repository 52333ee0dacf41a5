//! Convert serde_json::Value to types that sqlx can bind.

use serde_json::Value;
use sqlx::encode::{Encode, IsNull};
use sqlx::postgres::{PgTypeInfo, Postgres};
use sqlx::Database;

/// A value bound to a PostgreSQL query. Everything is sent as text and
/// the builder's `$n::type` casts restore the column type server-side.
#[derive(Clone, Debug)]
pub enum PgBindValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
    Json(Value),
}

impl PgBindValue {
    pub fn from_json(v: &Value) -> Self {
        match v {
            Value::Null => PgBindValue::Null,
            Value::Bool(b) => PgBindValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PgBindValue::I64(i)
                } else {
                    PgBindValue::F64(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => PgBindValue::String(s.clone()),
            Value::Array(_) | Value::Object(_) => PgBindValue::Json(v.clone()),
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            PgBindValue::Null => None,
            PgBindValue::Bool(b) => Some(b.to_string()),
            PgBindValue::I64(n) => Some(n.to_string()),
            PgBindValue::F64(n) => Some(n.to_string()),
            PgBindValue::String(s) => Some(s.clone()),
            PgBindValue::Json(v) => Some(v.to_string()),
        }
    }
}

impl<'q> Encode<'q, Postgres> for PgBindValue {
    fn encode_by_ref(
        &self,
        buf: &mut <Postgres as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, Box<dyn std::error::Error + Send + Sync>> {
        match self.as_text() {
            None => <Option<String> as Encode<Postgres>>::encode_by_ref(&None, buf),
            Some(text) => {
                let text_ref: &str = text.as_str();
                <&str as Encode<Postgres>>::encode_by_ref(&text_ref, buf)
            }
        }
    }
}

impl sqlx::Type<Postgres> for PgBindValue {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("TEXT")
    }
}
