//! Payload validation against generated input schemas.

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::ValidationErrors;
use crate::model::schema::{check_scalar, FieldSchema, InputSchema};
use crate::model::ValidationRule;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationMode {
    /// Required fields must be present (create).
    Full,
    /// Only the provided fields are checked (update).
    Partial,
}

/// Validates one object payload. Returns every complaint at once so
/// the client can fix a payload in one round trip.
pub fn validate_object(
    schema: &InputSchema,
    body: &Map<String, Value>,
    mode: ValidationMode,
    allow_unknown: bool,
) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    validate_into(schema, body, mode, allow_unknown, "", &mut errors);
    errors
}

/// Validates an array payload item by item, keying errors as
/// `<index>.<field>`.
pub fn validate_array(
    schema: &InputSchema,
    items: &[Value],
    mode: ValidationMode,
    allow_unknown: bool,
) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    for (index, item) in items.iter().enumerate() {
        match item.as_object() {
            Some(body) => {
                let item_errors = validate_object(schema, body, mode, allow_unknown);
                errors.merge_prefixed(&index.to_string(), item_errors);
            }
            None => errors.add(index.to_string(), "must be an object"),
        }
    }
    errors
}

fn validate_into(
    schema: &InputSchema,
    body: &Map<String, Value>,
    mode: ValidationMode,
    allow_unknown: bool,
    prefix: &str,
    errors: &mut ValidationErrors,
) {
    let key = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", prefix, name)
        }
    };

    if !allow_unknown {
        for name in body.keys() {
            if !schema.fields.contains_key(name) {
                errors.add(key(name), "unknown field");
            }
        }
    }

    if mode == ValidationMode::Full {
        for (name, field) in &schema.fields {
            if field.required && body.get(name).map_or(true, Value::is_null) {
                errors.add(key(name), "is required");
            }
        }
    }

    for (name, value) in body {
        let Some(field) = schema.fields.get(name) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        validate_field(field, value, mode, allow_unknown, &key(name), errors);
    }
}

fn validate_field(
    field: &FieldSchema,
    value: &Value,
    mode: ValidationMode,
    allow_unknown: bool,
    key: &str,
    errors: &mut ValidationErrors,
) {
    if let Some(field_type) = field.field_type {
        if let Some(complaint) = check_scalar(field_type, value) {
            errors.add(key, complaint);
            return;
        }
        if let Some(rule) = &field.rule {
            check_rule(key, value, rule, errors);
        }
        return;
    }

    // Relation entries: shape-check the nested payload. Schemaless
    // placeholders (cycle cut-offs) only get the container check.
    match field.type_name.as_str() {
        "object" => match value.as_object() {
            Some(nested) => {
                if let Some(schema) = &field.schema {
                    validate_into(schema, nested, mode, allow_unknown, key, errors);
                }
            }
            None => errors.add(key, "must be an object"),
        },
        "list" => match value.as_array() {
            Some(items) => {
                if let Some(schema) = &field.item_schema {
                    for (index, item) in items.iter().enumerate() {
                        let item_key = format!("{}.{}", key, index);
                        match item.as_object() {
                            Some(nested) => validate_into(
                                schema,
                                nested,
                                mode,
                                allow_unknown,
                                &item_key,
                                errors,
                            ),
                            None => errors.add(item_key, "must be an object"),
                        }
                    }
                }
            }
            None => errors.add(key, "must be a list"),
        },
        _ => {}
    }
}

fn check_rule(key: &str, value: &Value, rule: &ValidationRule, errors: &mut ValidationErrors) {
    if let Some(format) = &rule.format {
        check_format(key, value, format, errors);
    }
    if let Some(max) = rule.max_length {
        if let Some(s) = value.as_str() {
            if s.chars().count() > max as usize {
                errors.add(key, format!("must be at most {} characters", max));
            }
        }
    }
    if let Some(min) = rule.min_length {
        if let Some(s) = value.as_str() {
            if s.chars().count() < min as usize {
                errors.add(key, format!("must be at least {} characters", min));
            }
        }
    }
    if let Some(pattern) = &rule.pattern {
        match Regex::new(pattern) {
            Ok(re) => {
                if let Some(s) = value.as_str() {
                    if !re.is_match(s) {
                        errors.add(key, "does not match required pattern");
                    }
                }
            }
            Err(_) => errors.add(key, "invalid pattern in schema"),
        }
    }
    if let Some(allowed) = &rule.allowed {
        if !allowed.iter().any(|a| value_eq(value, a)) {
            errors.add(
                key,
                format!(
                    "must be one of: {:?}",
                    allowed.iter().take(5).collect::<Vec<_>>()
                ),
            );
        }
    }
    if let Some(min) = rule.minimum {
        if let Some(n) = value.as_f64() {
            if n < min {
                errors.add(key, format!("must be at least {}", min));
            }
        }
    }
    if let Some(max) = rule.maximum {
        if let Some(n) = value.as_f64() {
            if n > max {
                errors.add(key, format!("must be at most {}", max));
            }
        }
    }
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(n), Value::Number(m)) => n.as_f64() == m.as_f64(),
        _ => a == b,
    }
}

fn check_format(key: &str, value: &Value, format: &str, errors: &mut ValidationErrors) {
    match format.to_lowercase().as_str() {
        "email" => {
            if let Some(s) = value.as_str() {
                if !s.contains('@') || s.len() < 3 {
                    errors.add(key, "must be a valid email");
                }
            }
        }
        "uuid" => {
            if let Some(s) = value.as_str() {
                if uuid::Uuid::parse_str(s).is_err() {
                    errors.add(key, "must be a valid UUID");
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldDescriptor, ModelDescriptor, ModelGraph, RelationDescriptor};
    use serde_json::json;

    fn schema() -> InputSchema {
        let task = ModelDescriptor::new("Task", "tasks")
            .field(FieldDescriptor::integer("id"))
            .field(FieldDescriptor::text("title").required())
            .field(
                FieldDescriptor::text("priority").with_rule(ValidationRule {
                    allowed: Some(vec![json!("low"), json!("high")]),
                    ..Default::default()
                }),
            )
            .field(FieldDescriptor::datetime("due_at"))
            .relation(RelationDescriptor::to_many("comments", "Comment", "id", "task_id"));
        let comment = ModelDescriptor::new("Comment", "comments")
            .field(FieldDescriptor::integer("id"))
            .field(FieldDescriptor::text("text").required())
            .field(FieldDescriptor::integer("task_id"));
        let graph = ModelGraph::new([task, comment]);
        InputSchema::generate(&graph, graph.model("Task").unwrap()).unwrap()
    }

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn full_mode_demands_required_fields() {
        let errors = validate_object(
            &schema(),
            &obj(json!({"priority": "low"})),
            ValidationMode::Full,
            false,
        );
        assert_eq!(errors.fields["title"], vec!["is required"]);
    }

    #[test]
    fn partial_mode_checks_only_whats_there() {
        let errors = validate_object(
            &schema(),
            &obj(json!({"priority": "urgent"})),
            ValidationMode::Partial,
            false,
        );
        assert!(!errors.fields.contains_key("title"));
        assert!(errors.fields.contains_key("priority"));
    }

    #[test]
    fn unknown_fields_rejected_unless_allowed() {
        let body = obj(json!({"title": "x", "bogus": 1}));
        let strict = validate_object(&schema(), &body, ValidationMode::Full, false);
        assert!(strict.fields.contains_key("bogus"));
        let lax = validate_object(&schema(), &body, ValidationMode::Full, true);
        assert!(lax.is_empty());
    }

    #[test]
    fn nested_items_key_errors_by_index() {
        let body = obj(json!({
            "title": "x",
            "comments": [{"text": "ok"}, {"task_id": "not-an-int"}]
        }));
        let errors = validate_object(&schema(), &body, ValidationMode::Full, false);
        assert_eq!(errors.fields["comments.1.text"], vec!["is required"]);
        assert_eq!(
            errors.fields["comments.1.task_id"],
            vec!["must be an integer"]
        );
    }

    #[test]
    fn array_payload_prefixes_indices() {
        let items = vec![json!({"title": "a"}), json!({"priority": "low"})];
        let errors = validate_array(&schema(), &items, ValidationMode::Full, false);
        assert!(errors.fields.contains_key("1.title"));
        assert!(!errors.fields.contains_key("0.title"));
    }

    #[test]
    fn type_mismatches_are_reported() {
        let errors = validate_object(
            &schema(),
            &obj(json!({"title": "x", "due_at": "whenever"})),
            ValidationMode::Full,
            false,
        );
        assert_eq!(errors.fields["due_at"], vec!["must be a datetime"]);
    }
}
