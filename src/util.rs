//! Value coercion and CSV helpers shared by filters and batch upload.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::model::{FieldType, JsonKind, ModelDescriptor};

const TRUTHY: &[&str] = &["true", "t", "yes", "y", "on", "1"];
const FALSY: &[&str] = &["false", "f", "no", "n", "off", "0"];

/// Maps the accepted truthy/falsy spellings to a bool. `None` for
/// anything outside the table.
pub fn boolify(raw: &str) -> Option<bool> {
    let lowered = raw.trim().to_ascii_lowercase();
    if TRUTHY.contains(&lowered.as_str()) {
        Some(true)
    } else if FALSY.contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Accepts RFC 3339 plus the common separator-space and date-only
/// spellings clients actually send.
pub fn parse_datetime_flex(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Some(date) = parse_date_flex(raw) {
        return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    }
    None
}

pub fn parse_date_flex(raw: &str) -> Option<NaiveDate> {
    for fmt in ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw.trim(), fmt) {
            return Some(date);
        }
    }
    None
}

/// Coerces a raw string (query-string filter value or CSV cell) to the
/// JSON value a column of `field_type` stores.
pub fn coerce_str_value(field_type: FieldType, raw: &str) -> Result<Value, String> {
    match field_type {
        FieldType::Integer | FieldType::BigInt => raw
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("'{}' is not an integer", raw)),
        FieldType::Float | FieldType::Numeric => {
            let parsed = raw
                .trim()
                .parse::<f64>()
                .map_err(|_| format!("'{}' is not a number", raw))?;
            serde_json::Number::from_f64(parsed)
                .map(Value::Number)
                .ok_or_else(|| format!("'{}' is not a finite number", raw))
        }
        FieldType::Boolean => boolify(raw)
            .map(Value::Bool)
            .ok_or_else(|| format!("'{}' is not a boolean", raw)),
        FieldType::Text => Ok(Value::String(raw.to_string())),
        FieldType::Uuid => raw
            .trim()
            .parse::<uuid::Uuid>()
            .map(|u| Value::String(u.to_string()))
            .map_err(|_| format!("'{}' is not a uuid", raw)),
        FieldType::Date => parse_date_flex(raw)
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .ok_or_else(|| format!("'{}' is not a date", raw)),
        FieldType::DateTime => parse_datetime_flex(raw)
            .map(|dt| Value::String(dt.to_rfc3339()))
            .ok_or_else(|| format!("'{}' is not a datetime", raw)),
        FieldType::Json(kind) => {
            let parsed: Value =
                serde_json::from_str(raw).map_err(|_| format!("'{}' is not valid json", raw))?;
            match (kind, &parsed) {
                (JsonKind::List, Value::Array(_)) | (JsonKind::Object, Value::Object(_)) => {
                    Ok(parsed)
                }
                (JsonKind::List, _) => Err(format!("'{}' is not a json list", raw)),
                (JsonKind::Object, _) => Err(format!("'{}' is not a json object", raw)),
            }
        }
    }
}

/// Drops keys whose value is the empty string. CSV rows arrive with
/// every column present; empty cells mean "not provided".
pub fn remove_empty_values(row: &mut Map<String, Value>) {
    row.retain(|_, value| !matches!(value, Value::String(s) if s.is_empty()));
}

/// Coerces string-typed cells of a CSV row to the declared column
/// types. Unknown columns pass through untouched.
pub fn coerce_row_to_model_types(
    model: &ModelDescriptor,
    row: &mut Map<String, Value>,
) -> Result<(), String> {
    for (key, value) in row.iter_mut() {
        let Some(field) = model.field_named(key) else {
            continue;
        };
        if let Value::String(raw) = value {
            if field.field_type == FieldType::Text {
                continue;
            }
            let coerced = coerce_str_value(field.field_type, raw)
                .map_err(|e| format!("{}: {}", key, e))?;
            *value = coerced;
        }
    }
    Ok(())
}

/// Minimal CSV reader: header row, quoted fields, doubled-quote
/// escapes, CR/LF record ends. Returns one string-valued map per row.
pub fn parse_csv(text: &str) -> Result<Vec<Map<String, Value>>, String> {
    let mut records: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(ch),
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            ',' => {
                record.push(std::mem::take(&mut field));
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(ch),
        }
    }
    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }

    let mut rows = Vec::new();
    let mut iter = records.into_iter();
    let Some(header) = iter.next() else {
        return Ok(rows);
    };
    for (line_no, record) in iter.enumerate() {
        if record.iter().all(|cell| cell.is_empty()) {
            continue;
        }
        if record.len() != header.len() {
            return Err(format!(
                "row {} has {} fields, header has {}",
                line_no + 2,
                record.len(),
                header.len()
            ));
        }
        let mut row = Map::new();
        for (name, cell) in header.iter().zip(record) {
            row.insert(name.clone(), Value::String(cell));
        }
        rows.push(row);
    }
    Ok(rows)
}
