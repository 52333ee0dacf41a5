//! Turns entity declarations into a mounted router plus an
//! introspectable record of what got registered.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::entity::{Entity, Operation};
use crate::error::{ApiError, ConfigError};
use crate::jobs::JobRegistry;
use crate::model::{InputSchema, ModelDescriptor, ModelGraph};
use crate::service::query::QueryParams;
use crate::service::serializer::validate_shape;
use crate::state::AppState;
use crate::store::DataStore;

/// Router-wide settings, owned by the composition root.
#[derive(Clone)]
pub struct RouterConfig {
    /// Prefix every route is nested under; empty means the root.
    pub mount_path: String,
    pub permitted_operations: Option<Vec<Operation>>,
    pub forbidden_operations: Vec<Operation>,
    /// Accept body keys the schema does not know instead of rejecting.
    pub allow_unknown_fields: bool,
    pub register_schema_definition: bool,
    pub schema_definition_url: String,
    pub register_views_map: bool,
    pub views_map_url: String,
    pub cache_capacity: usize,
    pub introspection_cache_ttl: Duration,
    pub body_limit_bytes: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            mount_path: String::new(),
            permitted_operations: None,
            forbidden_operations: Vec::new(),
            allow_unknown_fields: false,
            register_schema_definition: true,
            schema_definition_url: "/schema-def".to_string(),
            register_views_map: true,
            views_map_url: "/views-map".to_string(),
            cache_capacity: 256,
            introspection_cache_ttl: Duration::from_secs(86400),
            body_limit_bytes: 2 * 1024 * 1024,
        }
    }
}

impl RouterConfig {
    pub fn new(mount_path: impl Into<String>) -> Self {
        RouterConfig {
            mount_path: mount_path.into(),
            ..RouterConfig::default()
        }
    }

    pub fn permit<I: IntoIterator<Item = Operation>>(mut self, ops: I) -> Self {
        self.permitted_operations = Some(ops.into_iter().collect());
        self
    }

    pub fn forbid<I: IntoIterator<Item = Operation>>(mut self, ops: I) -> Self {
        self.forbidden_operations = ops.into_iter().collect();
        self
    }

    pub fn allow_unknown_fields(mut self) -> Self {
        self.allow_unknown_fields = true;
        self
    }
}

/// One model's entry in the schema dump: either its generated input
/// schema, or a stub pointing at the base it derives from.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum SchemaEntry {
    Full {
        input_schema: InputSchema,
    },
    Derived {
        derived_from: String,
        polymorphic_identity: String,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct ViewEntry {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<InputSchema>,
}

/// Everything the mount registered, dumped by the introspection
/// routes. Built once, read-only afterwards.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RouteRegistry {
    pub models_registered: Vec<String>,
    pub model_schemas: BTreeMap<String, SchemaEntry>,
    pub views: BTreeMap<String, BTreeMap<String, ViewEntry>>,
}

/// Per-entity state the handlers run against.
pub struct EntityRuntime {
    pub entity: Entity,
    pub model: Arc<ModelDescriptor>,
    /// Verbs that actually got routes, after the permission chain.
    pub ops: Vec<Operation>,
    pub base_schema: InputSchema,
    op_schemas: BTreeMap<Operation, InputSchema>,
}

impl EntityRuntime {
    pub fn permits(&self, op: Operation) -> bool {
        self.ops.contains(&op)
    }

    pub fn schema_for(&self, op: Operation) -> &InputSchema {
        self.op_schemas.get(&op).unwrap_or(&self.base_schema)
    }

    /// Column the `:id` URL segment matches against: the per-request
    /// `_id_attr` override, then the entity's `id_field`, then the
    /// primary key.
    pub fn lookup_field(&self, params: &QueryParams) -> Result<String, ApiError> {
        if let Some(attr) = params.get("_id_attr") {
            if self.model.field_named(attr).is_none() {
                return Err(ApiError::BadRequest(format!(
                    "{} has no attribute '{}'",
                    self.model.name, attr
                )));
            }
            return Ok(attr.to_string());
        }
        if let Some(field) = &self.entity.id_field {
            return Ok(field.clone());
        }
        Ok(self.model.primary_key.clone())
    }

    /// Route pattern for a verb, without the mount prefix.
    pub fn url_for(&self, op: Operation) -> String {
        if let Some(url) = &self.entity.op_common(op).url {
            return url.clone();
        }
        match op {
            Operation::Index | Operation::Post => format!("/{}", self.entity.slug),
            Operation::Get | Operation::Put | Operation::Patch | Operation::Delete => {
                format!("/{}/:id", self.entity.slug)
            }
            Operation::BatchSave => format!("/batch-save/{}", self.entity.slug),
        }
    }
}

const BODY_OPS: [Operation; 4] = [
    Operation::Post,
    Operation::Put,
    Operation::Patch,
    Operation::BatchSave,
];

fn op_enabled(entity: &Entity, config: &RouterConfig, op: Operation) -> bool {
    if let Some(decision) = entity.permits(op) {
        return decision;
    }
    if let Some(permitted) = &config.permitted_operations {
        return permitted.contains(&op);
    }
    if !config.forbidden_operations.is_empty() {
        return !config.forbidden_operations.contains(&op);
    }
    true
}

fn shape_err(e: ApiError) -> ConfigError {
    ConfigError::InvalidDescriptor(e.to_string())
}

fn validate_entity(
    graph: &ModelGraph,
    entity: &Entity,
    model: &ModelDescriptor,
    ops: &[Operation],
) -> Result<(), ConfigError> {
    if let Some(field) = &entity.id_field {
        if model.field_named(field).is_none() {
            return Err(ConfigError::UnknownField {
                model: model.name.clone(),
                field: field.clone(),
            });
        }
    }
    if let Some(order_by) = &entity.index.defaults.order_by {
        if model.field_named(order_by).is_none() {
            return Err(ConfigError::UnknownField {
                model: model.name.clone(),
                field: order_by.clone(),
            });
        }
    }
    for field in &entity.batch_save.unique_identifier_fields {
        if model.field_named(field).is_none() {
            return Err(ConfigError::UnknownField {
                model: model.name.clone(),
                field: field.clone(),
            });
        }
    }
    if let Some(shape) = &entity.shape {
        validate_shape(graph, model, shape).map_err(shape_err)?;
    }
    for op in Operation::ALL {
        if let Some(shape) = &entity.op_common(op).shape {
            validate_shape(graph, model, shape).map_err(shape_err)?;
        }
    }
    for op in ops {
        if let Some(url) = &entity.op_common(*op).url {
            let needs_id = matches!(op, Operation::Put | Operation::Patch | Operation::Delete);
            if needs_id && !url.contains(":id") {
                return Err(ConfigError::InvalidDescriptor(format!(
                    "custom {} url '{}' for '{}' must contain :id",
                    op, url, entity.slug
                )));
            }
            if *op == Operation::Get && !url.contains(":id") && entity.get.getter.is_none() {
                return Err(ConfigError::InvalidDescriptor(format!(
                    "custom get url '{}' for '{}' has no :id and no object getter",
                    url, entity.slug
                )));
            }
        }
    }
    Ok(())
}

fn build_runtime(
    graph: &ModelGraph,
    config: &RouterConfig,
    entity: Entity,
) -> Result<EntityRuntime, ConfigError> {
    let model = graph.require(&entity.model)?.clone();
    let ops: Vec<Operation> = Operation::ALL
        .into_iter()
        .filter(|op| op_enabled(&entity, config, *op))
        .collect();
    validate_entity(graph, &entity, &model, &ops)?;

    let mut base_schema = InputSchema::generate(graph, &model)?;
    if let Some(modifier) = &entity.schema_modifier {
        base_schema = modifier(base_schema);
    }
    let mut op_schemas = BTreeMap::new();
    for op in BODY_OPS {
        if let Some(modifier) = &entity.op_common(op).schema_modifier {
            op_schemas.insert(op, modifier(base_schema.clone()));
        }
    }

    Ok(EntityRuntime {
        entity,
        model,
        ops,
        base_schema,
        op_schemas,
    })
}

/// Registers the model's schema plus every model reachable through
/// its relations, and stubs for polymorphic subtypes. Idempotent.
fn register_schemas(
    graph: &ModelGraph,
    model: &ModelDescriptor,
    schemas: &mut BTreeMap<String, SchemaEntry>,
) -> Result<(), ConfigError> {
    let mut pending = vec![model.name.clone()];
    let mut seen = HashSet::new();
    while let Some(name) = pending.pop() {
        if !seen.insert(name.clone()) {
            continue;
        }
        let current = graph.require(&name)?;
        let schema = InputSchema::generate(graph, current)?;
        schemas.insert(name.clone(), SchemaEntry::Full {
            input_schema: schema,
        });
        if let Some(spec) = &current.polymorphic {
            for subtype in &spec.subtypes {
                schemas
                    .entry(subtype.name.clone())
                    .or_insert_with(|| SchemaEntry::Derived {
                        derived_from: current.name.clone(),
                        polymorphic_identity: subtype.identity.clone(),
                    });
            }
        }
        for relation in &current.relations {
            if !seen.contains(&relation.target) {
                pending.push(relation.target.clone());
            }
        }
    }
    Ok(())
}

fn join_mount(mount_path: &str, url: &str) -> String {
    let trimmed = mount_path.trim_end_matches('/');
    if trimmed.is_empty() {
        url.to_string()
    } else {
        format!("{}{}", trimmed, url)
    }
}

/// Declarative entry point: collect entities, then `mount` them into
/// an axum router over a store. Spawns the batch worker, so it must
/// run inside the async runtime.
pub struct EntityRouter {
    config: RouterConfig,
    entities: Vec<Entity>,
}

impl EntityRouter {
    pub fn new(config: RouterConfig) -> Self {
        EntityRouter {
            config,
            entities: Vec::new(),
        }
    }

    pub fn register(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn mount(
        self,
        graph: ModelGraph,
        store: Arc<dyn DataStore>,
    ) -> Result<(axum::Router, AppState), ConfigError> {
        let config = self.config;
        let mut runtimes: HashMap<String, Arc<EntityRuntime>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        let mut registry = RouteRegistry::default();
        let mut taken_routes: HashSet<(&'static str, String)> = HashSet::new();

        for entity in self.entities {
            let slug = entity.slug.clone();
            if runtimes.contains_key(&slug) {
                return Err(ConfigError::DuplicateSlug(slug));
            }
            let runtime = build_runtime(&graph, &config, entity)?;

            if !registry.models_registered.contains(&runtime.model.name) {
                registry.models_registered.push(runtime.model.name.clone());
            }
            register_schemas(&graph, &runtime.model, &mut registry.model_schemas)?;
            let views = registry.views.entry(runtime.model.name.clone()).or_default();
            for op in &runtime.ops {
                let url = runtime.url_for(*op);
                if !taken_routes.insert((op.method(), url.clone())) {
                    return Err(ConfigError::DuplicateRoute {
                        method: op.method(),
                        url,
                    });
                }
                views.insert(
                    op.as_str().to_string(),
                    ViewEntry {
                        url: join_mount(&config.mount_path, &url),
                        input_schema: BODY_OPS
                            .contains(op)
                            .then(|| runtime.schema_for(*op).clone()),
                    },
                );
            }

            order.push(slug.clone());
            runtimes.insert(slug, Arc::new(runtime));
        }

        let (batch_tx, batch_rx) = tokio::sync::mpsc::unbounded_channel();
        let state = AppState {
            graph: Arc::new(graph),
            store,
            runtimes: Arc::new(runtimes),
            registry: Arc::new(registry),
            cache: Arc::new(crate::cache::ResponseCache::new(config.cache_capacity)),
            jobs: Arc::new(JobRegistry::new()),
            batch_tx,
            config: Arc::new(config),
        };

        let router = crate::routes::build_router(state.clone(), &order)?;
        tokio::spawn(crate::jobs::batch_worker(batch_rx, state.clone()));
        tracing::info!(entities = order.len(), "entity router mounted");
        Ok((router, state))
    }
}
