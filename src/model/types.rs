//! Caller-declared model descriptors: fields, relations, polymorphism.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonKind {
    List,
    Object,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Integer,
    BigInt,
    Float,
    Numeric,
    Boolean,
    Text,
    Uuid,
    Date,
    DateTime,
    Json(JsonKind),
}

impl FieldType {
    pub fn pg_type(&self) -> &'static str {
        match self {
            FieldType::Integer => "integer",
            FieldType::BigInt => "bigint",
            FieldType::Float => "double precision",
            FieldType::Numeric => "numeric",
            FieldType::Boolean => "boolean",
            FieldType::Text => "text",
            FieldType::Uuid => "uuid",
            FieldType::Date => "date",
            FieldType::DateTime => "timestamptz",
            FieldType::Json(_) => "jsonb",
        }
    }

    /// Wire name used in generated schemas.
    pub fn schema_name(&self) -> &'static str {
        match self {
            FieldType::Integer | FieldType::BigInt => "integer",
            FieldType::Float | FieldType::Numeric => "number",
            FieldType::Boolean => "boolean",
            FieldType::Text => "string",
            FieldType::Uuid => "string",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
            FieldType::Json(JsonKind::List) => "list",
            FieldType::Json(JsonKind::Object) => "object",
        }
    }
}

/// Startup-time default applied by the store when a column is absent
/// from an insert.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultValue {
    AutoIncrement,
    GeneratedUuid,
    Now,
    Literal(serde_json::Value),
}

/// Per-field constraint set enforced by the validation engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub min_length: Option<u32>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub allowed: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<DefaultValue>,
    #[serde(default)]
    pub rule: Option<ValidationRule>,
}

fn default_true() -> bool {
    true
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            nullable: true,
            default: None,
            rule: None,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn bigint(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::BigInt)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Float)
    }

    pub fn numeric(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Numeric)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Text)
    }

    pub fn uuid(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Uuid)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Date)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::DateTime)
    }

    pub fn json_list(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Json(JsonKind::List))
    }

    pub fn json_object(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Json(JsonKind::Object))
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.rule = Some(rule);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    ToOne,
    ToMany,
}

/// A navigable edge between two models. `local_column` lives on the
/// owning model, `remote_column` on the target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationDescriptor {
    pub name: String,
    pub target: String,
    pub kind: RelationKind,
    pub local_column: String,
    pub remote_column: String,
}

impl RelationDescriptor {
    pub fn to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        local_column: impl Into<String>,
        remote_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::ToOne,
            local_column: local_column.into(),
            remote_column: remote_column.into(),
        }
    }

    pub fn to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        local_column: impl Into<String>,
        remote_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::ToMany,
            local_column: local_column.into(),
            remote_column: remote_column.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubtypeDescriptor {
    pub name: String,
    pub identity: String,
}

/// Tagged-variant registry for single-table polymorphic models: the
/// discriminator column plus the known identities.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolymorphicSpec {
    pub discriminator: String,
    pub subtypes: Vec<SubtypeDescriptor>,
}

impl PolymorphicSpec {
    pub fn new(discriminator: impl Into<String>) -> Self {
        Self {
            discriminator: discriminator.into(),
            subtypes: Vec::new(),
        }
    }

    pub fn subtype(mut self, name: impl Into<String>, identity: impl Into<String>) -> Self {
        self.subtypes.push(SubtypeDescriptor {
            name: name.into(),
            identity: identity.into(),
        });
        self
    }

    pub fn identities(&self) -> Vec<&str> {
        self.subtypes.iter().map(|s| s.identity.as_str()).collect()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub table: String,
    pub primary_key: String,
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub relations: Vec<RelationDescriptor>,
    #[serde(default)]
    pub polymorphic: Option<PolymorphicSpec>,
    /// Default scalar attrs serialized when no shape narrows them;
    /// `None` means every field.
    #[serde(default)]
    pub default_attrs: Option<Vec<String>>,
    #[serde(default)]
    pub non_settable_fields: Vec<String>,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            primary_key: "id".to_string(),
            fields: Vec::new(),
            relations: Vec::new(),
            polymorphic: None,
            default_attrs: None,
            non_settable_fields: Vec::new(),
        }
    }

    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        self.primary_key = name.into();
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn relation(mut self, relation: RelationDescriptor) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn polymorphic(mut self, spec: PolymorphicSpec) -> Self {
        self.polymorphic = Some(spec);
        self
    }

    pub fn default_attrs<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_attrs = Some(attrs.into_iter().map(Into::into).collect());
        self
    }

    pub fn non_settable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.non_settable_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn field_named(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation_named(&self, name: &str) -> Option<&RelationDescriptor> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn pk_field(&self) -> Option<&FieldDescriptor> {
        self.field_named(&self.primary_key)
    }

    pub fn pk_type(&self) -> FieldType {
        self.pk_field()
            .map(|f| f.field_type)
            .unwrap_or(FieldType::Integer)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

/// All models known to one composition root, keyed by name. Relation
/// targets resolve through here.
#[derive(Clone, Debug, Default)]
pub struct ModelGraph {
    models: BTreeMap<String, Arc<ModelDescriptor>>,
}

impl ModelGraph {
    pub fn new(models: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        Self {
            models: models
                .into_iter()
                .map(|m| (m.name.clone(), Arc::new(m)))
                .collect(),
        }
    }

    pub fn model(&self, name: &str) -> Option<&Arc<ModelDescriptor>> {
        self.models.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Arc<ModelDescriptor>, ConfigError> {
        self.models
            .get(name)
            .ok_or_else(|| ConfigError::UnknownModel(name.to_string()))
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<ModelDescriptor>> {
        self.models.values()
    }

    /// Follows a relation edge to the target model's descriptor.
    pub fn relation_target(
        &self,
        model: &ModelDescriptor,
        relation: &RelationDescriptor,
    ) -> Result<&Arc<ModelDescriptor>, ConfigError> {
        self.models
            .get(&relation.target)
            .ok_or_else(|| ConfigError::UnknownRelation {
                model: model.name.clone(),
                relation: relation.name.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_wires_lookups() {
        let model = ModelDescriptor::new("Task", "tasks")
            .field(
                FieldDescriptor::integer("id").default_value(DefaultValue::AutoIncrement),
            )
            .field(FieldDescriptor::text("title").required())
            .relation(RelationDescriptor::to_many("comments", "Comment", "id", "task_id"));
        assert_eq!(model.pk_type(), FieldType::Integer);
        assert!(model.field_named("title").is_some());
        assert!(model.field_named("missing").is_none());
        assert_eq!(
            model.relation_named("comments").map(|r| r.kind),
            Some(RelationKind::ToMany)
        );
    }

    #[test]
    fn graph_resolves_relation_targets() {
        let task = ModelDescriptor::new("Task", "tasks")
            .field(FieldDescriptor::integer("id"))
            .relation(RelationDescriptor::to_one("owner", "User", "user_id", "id"));
        let user = ModelDescriptor::new("User", "users").field(FieldDescriptor::integer("id"));
        let graph = ModelGraph::new([task, user]);

        let task = graph.require("Task").unwrap().clone();
        let rel = task.relation_named("owner").unwrap();
        assert_eq!(graph.relation_target(&task, rel).unwrap().name, "User");
        assert!(graph.require("Ghost").is_err());
    }
}
