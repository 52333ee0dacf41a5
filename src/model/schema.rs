//! Input-schema generation from model descriptors.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::error::ConfigError;
use crate::model::{
    FieldType, JsonKind, ModelDescriptor, ModelGraph, RelationKind, ValidationRule,
};

/// Validation view of one accepted key. Scalar fields carry their
/// column type; relation fields carry a nested schema instead.
#[derive(Clone, Debug, Serialize)]
pub struct FieldSchema {
    pub required: bool,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<ValidationRule>,
    /// Nested object schema for to-one relations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Box<InputSchema>>,
    /// Item schema for to-many relations (`type_name` is then "list").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_schema: Option<Box<InputSchema>>,
    #[serde(skip)]
    pub field_type: Option<FieldType>,
}

impl FieldSchema {
    fn scalar(required: bool, field_type: FieldType, rule: Option<ValidationRule>) -> Self {
        FieldSchema {
            required,
            type_name: field_type.schema_name().to_string(),
            rule,
            schema: None,
            item_schema: None,
            field_type: Some(field_type),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct InputSchema {
    pub model: String,
    pub fields: BTreeMap<String, FieldSchema>,
}

impl InputSchema {
    /// Walks a descriptor into the accepted-payload schema. Relations
    /// recurse one schema per target model; already-visited models map
    /// to container placeholders so cycles terminate.
    pub fn generate(graph: &ModelGraph, model: &ModelDescriptor) -> Result<InputSchema, ConfigError> {
        let mut seen = HashSet::new();
        Self::generate_inner(graph, model, &mut seen)
    }

    fn generate_inner(
        graph: &ModelGraph,
        model: &ModelDescriptor,
        seen: &mut HashSet<String>,
    ) -> Result<InputSchema, ConfigError> {
        seen.insert(model.name.clone());
        let mut fields = BTreeMap::new();
        for field in &model.fields {
            let mut rule = field.rule.clone();
            if let Some(poly) = &model.polymorphic {
                if field.name == poly.discriminator {
                    let allowed = poly
                        .subtypes
                        .iter()
                        .map(|s| serde_json::Value::String(s.identity.clone()))
                        .collect();
                    let mut merged = rule.unwrap_or_default();
                    merged.allowed.get_or_insert(allowed);
                    rule = Some(merged);
                }
            }
            fields.insert(
                field.name.clone(),
                FieldSchema::scalar(field.required, field.field_type, rule),
            );
        }
        for relation in &model.relations {
            let target = graph.relation_target(model, relation)?;
            let nested = if seen.contains(&target.name) {
                None
            } else {
                Some(Box::new(Self::generate_inner(graph, target, seen)?))
            };
            let entry = match relation.kind {
                RelationKind::ToOne => FieldSchema {
                    required: false,
                    type_name: "object".to_string(),
                    rule: None,
                    schema: nested,
                    item_schema: None,
                    field_type: None,
                },
                RelationKind::ToMany => FieldSchema {
                    required: false,
                    type_name: "list".to_string(),
                    rule: None,
                    schema: None,
                    item_schema: nested,
                    field_type: None,
                },
            };
            fields.insert(relation.name.clone(), entry);
        }
        Ok(InputSchema {
            model: model.name.clone(),
            fields,
        })
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    pub fn remove_field(&mut self, name: &str) -> Option<FieldSchema> {
        self.fields.remove(name)
    }

    pub fn set_required(&mut self, name: &str, required: bool) {
        if let Some(field) = self.fields.get_mut(name) {
            field.required = required;
        }
    }
}

/// Checks a JSON value against a scalar column type. `None` when
/// acceptable, otherwise the complaint.
pub fn check_scalar(field_type: FieldType, value: &serde_json::Value) -> Option<String> {
    use serde_json::Value;
    let ok = match field_type {
        FieldType::Integer | FieldType::BigInt => {
            value.as_i64().is_some() || value.as_u64().is_some()
        }
        FieldType::Float | FieldType::Numeric => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Text => value.is_string(),
        FieldType::Uuid => value
            .as_str()
            .map_or(false, |s| uuid::Uuid::parse_str(s).is_ok()),
        FieldType::Date => value
            .as_str()
            .map_or(false, |s| crate::util::parse_date_flex(s).is_some()),
        FieldType::DateTime => value
            .as_str()
            .map_or(false, |s| crate::util::parse_datetime_flex(s).is_some()),
        FieldType::Json(JsonKind::List) => value.is_array(),
        FieldType::Json(JsonKind::Object) => value.is_object(),
    };
    if ok {
        return None;
    }
    Some(match field_type {
        FieldType::Integer | FieldType::BigInt => "must be an integer".to_string(),
        FieldType::Float | FieldType::Numeric => "must be a number".to_string(),
        FieldType::Boolean => "must be a boolean".to_string(),
        FieldType::Text => "must be a string".to_string(),
        FieldType::Uuid => "must be a valid UUID".to_string(),
        FieldType::Date => "must be a date".to_string(),
        FieldType::DateTime => "must be a datetime".to_string(),
        FieldType::Json(JsonKind::List) => "must be a list".to_string(),
        FieldType::Json(JsonKind::Object) => "must be an object".to_string(),
    })
}
