//! Entity declarations: which verbs a resource exposes and the hooks,
//! scopes, and shapes each verb runs with.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ApiError;
use crate::model::{InputSchema, ModelDescriptor, ModelGraph};
use crate::response::ApiResponse;
use crate::service::query::{IndexDefaults, QueryParams};
use crate::service::serializer::ResponseShape;
use crate::store::{DataStore, Row, StoreQuery};

/// The verb set a resource can expose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    Index,
    Get,
    Post,
    Put,
    Patch,
    Delete,
    BatchSave,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::Index,
        Operation::Get,
        Operation::Post,
        Operation::Put,
        Operation::Patch,
        Operation::Delete,
        Operation::BatchSave,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Index => "index",
            Operation::Get => "get",
            Operation::Post => "post",
            Operation::Put => "put",
            Operation::Patch => "patch",
            Operation::Delete => "delete",
            Operation::BatchSave => "batch_save",
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Operation::Index | Operation::Get => "GET",
            Operation::Post | Operation::BatchSave => "POST",
            Operation::Put => "PUT",
            Operation::Patch => "PATCH",
            Operation::Delete => "DELETE",
        }
    }

}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a hook may look at. Optional parts are filled in as the
/// pipeline progresses.
pub struct HookArgs<'a> {
    pub store: &'a dyn DataStore,
    pub graph: &'a ModelGraph,
    pub model: &'a ModelDescriptor,
    pub slug: &'a str,
    pub operation: Operation,
    pub params: &'a QueryParams,
    pub id: Option<&'a str>,
    /// Row as it stood before the write, when one exists.
    pub existing: Option<&'a Row>,
    /// Body after field filtering and adaptation.
    pub payload: Option<&'a Row>,
    /// Body exactly as received.
    pub raw_payload: Option<&'a Value>,
}

impl<'a> HookArgs<'a> {
    pub fn new(
        store: &'a dyn DataStore,
        graph: &'a ModelGraph,
        model: &'a ModelDescriptor,
        slug: &'a str,
        operation: Operation,
        params: &'a QueryParams,
    ) -> Self {
        HookArgs {
            store,
            graph,
            model,
            slug,
            operation,
            params,
            id: None,
            existing: None,
            payload: None,
            raw_payload: None,
        }
    }
}

/// What a hook decides: keep going, or answer the request itself.
pub enum HookFlow {
    Continue,
    Respond(ApiResponse),
}

#[async_trait]
pub trait BeforeHook: Send + Sync {
    async fn run(&self, args: &HookArgs<'_>, payload: &mut Row) -> Result<HookFlow, ApiError>;
}

#[async_trait]
impl<F> BeforeHook for F
where
    F: for<'a, 'b> Fn(&'a HookArgs<'b>, &'a mut Row) -> Result<HookFlow, ApiError> + Send + Sync,
{
    async fn run(&self, args: &HookArgs<'_>, payload: &mut Row) -> Result<HookFlow, ApiError> {
        self(args, payload)
    }
}

#[async_trait]
pub trait AfterHook: Send + Sync {
    /// `row` is the persisted row; mutations to it flow into the
    /// response, not back into the store.
    async fn run(&self, args: &HookArgs<'_>, row: &mut Row) -> Result<HookFlow, ApiError>;
}

#[async_trait]
impl<F> AfterHook for F
where
    F: for<'a, 'b> Fn(&'a HookArgs<'b>, &'a mut Row) -> Result<HookFlow, ApiError> + Send + Sync,
{
    async fn run(&self, args: &HookArgs<'_>, row: &mut Row) -> Result<HookFlow, ApiError> {
        self(args, row)
    }
}

pub enum CommandOutcome {
    /// Changes to persist on the target row; the handler responds with
    /// the updated row afterwards.
    Update(Row),
    /// Fully handled.
    Respond(ApiResponse),
}

/// Named mutation dispatched on the `cmd` key of a PATCH body.
#[async_trait]
pub trait PatchCommand: Send + Sync {
    async fn apply(
        &self,
        args: &HookArgs<'_>,
        row: &Row,
        payload: &Row,
    ) -> Result<CommandOutcome, ApiError>;
}

pub enum Access {
    Granted,
    Denied(String),
}

#[async_trait]
pub trait AccessChecker: Send + Sync {
    async fn check(&self, args: &HookArgs<'_>) -> Result<Access, ApiError>;
}

#[async_trait]
impl<F> AccessChecker for F
where
    F: for<'a, 'b> Fn(&'a HookArgs<'b>) -> Access + Send + Sync,
{
    async fn check(&self, args: &HookArgs<'_>) -> Result<Access, ApiError> {
        Ok(self(args))
    }
}

/// Replaces the stock primary-key lookup for singleton resolution.
#[async_trait]
pub trait ObjectGetter: Send + Sync {
    async fn fetch(&self, args: &HookArgs<'_>) -> Result<Option<Row>, ApiError>;
}

pub type QueryScope = Arc<dyn Fn(StoreQuery) -> StoreQuery + Send + Sync>;
pub type PayloadAdapter = Arc<dyn Fn(Value) -> Result<Value, ApiError> + Send + Sync>;
pub type ResponseTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;
pub type ErrorMapper = Arc<dyn Fn(ApiError) -> ApiError + Send + Sync>;
pub type SchemaModifier = Arc<dyn Fn(InputSchema) -> InputSchema + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
}

impl CachePolicy {
    pub fn ttl_secs(secs: u64) -> Self {
        CachePolicy {
            ttl: Duration::from_secs(secs),
        }
    }
}

/// Knobs every operation shares. Unset pieces fall back to the
/// entity-level equivalents.
#[derive(Clone, Default)]
pub struct OpCommon {
    pub url: Option<String>,
    pub access: Option<Arc<dyn AccessChecker>>,
    pub scope: Option<QueryScope>,
    pub shape: Option<ResponseShape>,
    pub adapter: Option<PayloadAdapter>,
    pub transform: Option<ResponseTransform>,
    pub error_mapper: Option<ErrorMapper>,
    pub schema_modifier: Option<SchemaModifier>,
}

#[derive(Clone, Default)]
pub struct IndexOp {
    pub common: OpCommon,
    pub defaults: IndexDefaults,
    pub cache: Option<CachePolicy>,
}

#[derive(Clone, Default)]
pub struct GetOp {
    pub common: OpCommon,
    pub getter: Option<Arc<dyn ObjectGetter>>,
    pub cache: Option<CachePolicy>,
}

#[derive(Clone, Default)]
pub struct PostOp {
    pub common: OpCommon,
    pub before: Vec<Arc<dyn BeforeHook>>,
    pub after: Vec<Arc<dyn AfterHook>>,
    pub settable_fields: Option<Vec<String>>,
    pub non_settable_fields: Vec<String>,
}

#[derive(Clone, Default)]
pub struct PutOp {
    pub common: OpCommon,
    pub before: Vec<Arc<dyn BeforeHook>>,
    pub after: Vec<Arc<dyn AfterHook>>,
    pub settable_fields: Option<Vec<String>>,
    pub non_settable_fields: Vec<String>,
}

#[derive(Clone, Default)]
pub struct PatchOp {
    pub common: OpCommon,
    pub before: Vec<Arc<dyn BeforeHook>>,
    pub after: Vec<Arc<dyn AfterHook>>,
    pub commands: BTreeMap<String, Arc<dyn PatchCommand>>,
    pub settable_fields: Option<Vec<String>>,
    pub non_settable_fields: Vec<String>,
}

#[derive(Clone, Default)]
pub struct DeleteOp {
    pub common: OpCommon,
    pub before: Vec<Arc<dyn BeforeHook>>,
    pub after: Vec<Arc<dyn AfterHook>>,
}

/// Batch rows run the put or post hook set depending on whether a row
/// matched an existing record, so this op declares no hooks of its own.
#[derive(Clone, Default)]
pub struct BatchSaveOp {
    pub common: OpCommon,
    pub non_settable_fields: Vec<String>,
    /// Lookup columns tried, in order, when a row carries no primary
    /// key; a hit turns the row into an update.
    pub unique_identifier_fields: Vec<String>,
    pub update_only: bool,
    pub create_only: bool,
    /// Enqueue instead of saving inline; responses carry the job id.
    pub run_async: bool,
}

/// One exposed resource: a model plus the routing and behavior
/// declared for it. Built at startup, immutable while serving.
#[derive(Clone)]
pub struct Entity {
    pub model: String,
    pub slug: String,
    pub permitted_operations: Option<Vec<Operation>>,
    pub forbidden_operations: Vec<Operation>,
    /// Lookup column for `:id` URLs; defaults to the primary key.
    pub id_field: Option<String>,
    pub enable_caching: bool,
    pub cache_timeout: Duration,
    pub access: Option<Arc<dyn AccessChecker>>,
    pub scope: Option<QueryScope>,
    pub shape: Option<ResponseShape>,
    pub adapter: Option<PayloadAdapter>,
    pub transform: Option<ResponseTransform>,
    pub error_mapper: Option<ErrorMapper>,
    pub schema_modifier: Option<SchemaModifier>,
    pub settable_fields: Option<Vec<String>>,
    pub non_settable_fields: Vec<String>,
    pub index: IndexOp,
    pub get: GetOp,
    pub post: PostOp,
    pub put: PutOp,
    pub patch: PatchOp,
    pub delete: DeleteOp,
    pub batch_save: BatchSaveOp,
}

impl Entity {
    pub fn new(model: impl Into<String>, slug: impl Into<String>) -> Self {
        Entity {
            model: model.into(),
            slug: slug.into(),
            permitted_operations: None,
            forbidden_operations: Vec::new(),
            id_field: None,
            enable_caching: false,
            cache_timeout: Duration::from_secs(300),
            access: None,
            scope: None,
            shape: None,
            adapter: None,
            transform: None,
            error_mapper: None,
            schema_modifier: None,
            settable_fields: None,
            non_settable_fields: Vec::new(),
            index: IndexOp::default(),
            get: GetOp::default(),
            post: PostOp::default(),
            put: PutOp::default(),
            patch: PatchOp::default(),
            delete: DeleteOp::default(),
            batch_save: BatchSaveOp::default(),
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

    pub fn id_field(mut self, column: impl Into<String>) -> Self {
        self.id_field = Some(column.into());
        self
    }

    pub fn cached(mut self, timeout: Duration) -> Self {
        self.enable_caching = true;
        self.cache_timeout = timeout;
        self
    }

    pub fn access(mut self, checker: impl AccessChecker + 'static) -> Self {
        self.access = Some(Arc::new(checker));
        self
    }

    pub fn scope(
        mut self,
        scope: impl Fn(StoreQuery) -> StoreQuery + Send + Sync + 'static,
    ) -> Self {
        self.scope = Some(Arc::new(scope));
        self
    }

    pub fn shape(mut self, shape: ResponseShape) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn settable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settable_fields = Some(fields.into_iter().map(Into::into).collect());
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

    pub fn error_mapper(
        mut self,
        mapper: impl Fn(ApiError) -> ApiError + Send + Sync + 'static,
    ) -> Self {
        self.error_mapper = Some(Arc::new(mapper));
        self
    }

    pub fn schema_modifier(
        mut self,
        modifier: impl Fn(InputSchema) -> InputSchema + Send + Sync + 'static,
    ) -> Self {
        self.schema_modifier = Some(Arc::new(modifier));
        self
    }

    pub fn index_op(mut self, op: IndexOp) -> Self {
        self.index = op;
        self
    }

    pub fn get_op(mut self, op: GetOp) -> Self {
        self.get = op;
        self
    }

    pub fn post_op(mut self, op: PostOp) -> Self {
        self.post = op;
        self
    }

    pub fn put_op(mut self, op: PutOp) -> Self {
        self.put = op;
        self
    }

    pub fn patch_op(mut self, op: PatchOp) -> Self {
        self.patch = op;
        self
    }

    pub fn delete_op(mut self, op: DeleteOp) -> Self {
        self.delete = op;
        self
    }

    pub fn batch_save_op(mut self, op: BatchSaveOp) -> Self {
        self.batch_save = op;
        self
    }

    pub fn before_post(mut self, hook: impl BeforeHook + 'static) -> Self {
        self.post.before.push(Arc::new(hook));
        self
    }

    pub fn after_post(mut self, hook: impl AfterHook + 'static) -> Self {
        self.post.after.push(Arc::new(hook));
        self
    }

    pub fn before_put(mut self, hook: impl BeforeHook + 'static) -> Self {
        self.put.before.push(Arc::new(hook));
        self
    }

    pub fn after_put(mut self, hook: impl AfterHook + 'static) -> Self {
        self.put.after.push(Arc::new(hook));
        self
    }

    pub fn before_delete(mut self, hook: impl BeforeHook + 'static) -> Self {
        self.delete.before.push(Arc::new(hook));
        self
    }

    pub fn after_delete(mut self, hook: impl AfterHook + 'static) -> Self {
        self.delete.after.push(Arc::new(hook));
        self
    }

    pub fn patch_command(
        mut self,
        name: impl Into<String>,
        command: impl PatchCommand + 'static,
    ) -> Self {
        self.patch.commands.insert(name.into(), Arc::new(command));
        self
    }

    pub fn object_getter(mut self, getter: impl ObjectGetter + 'static) -> Self {
        self.get.getter = Some(Arc::new(getter));
        self
    }

    pub fn op_common(&self, op: Operation) -> &OpCommon {
        match op {
            Operation::Index => &self.index.common,
            Operation::Get => &self.get.common,
            Operation::Post => &self.post.common,
            Operation::Put => &self.put.common,
            Operation::Patch => &self.patch.common,
            Operation::Delete => &self.delete.common,
            Operation::BatchSave => &self.batch_save.common,
        }
    }

    /// Entity-level verb gate; the router-level gate layers on top.
    pub fn permits(&self, op: Operation) -> Option<bool> {
        if let Some(permitted) = &self.permitted_operations {
            return Some(permitted.contains(&op));
        }
        if !self.forbidden_operations.is_empty() {
            return Some(!self.forbidden_operations.contains(&op));
        }
        None
    }

    pub fn access_for(&self, op: Operation) -> Option<&Arc<dyn AccessChecker>> {
        self.op_common(op).access.as_ref().or(self.access.as_ref())
    }

    pub fn scope_for(&self, op: Operation) -> Option<&QueryScope> {
        self.op_common(op).scope.as_ref().or(self.scope.as_ref())
    }

    pub fn shape_for(&self, op: Operation) -> ResponseShape {
        self.op_common(op)
            .shape
            .as_ref()
            .or(self.shape.as_ref())
            .cloned()
            .unwrap_or_default()
    }

    pub fn adapter_for(&self, op: Operation) -> Option<&PayloadAdapter> {
        self.op_common(op).adapter.as_ref().or(self.adapter.as_ref())
    }

    pub fn transform_for(&self, op: Operation) -> Option<&ResponseTransform> {
        self.op_common(op)
            .transform
            .as_ref()
            .or(self.transform.as_ref())
    }

    pub fn cache_for(&self, op: Operation) -> Option<CachePolicy> {
        let op_cache = match op {
            Operation::Index => self.index.cache,
            Operation::Get => self.get.cache,
            _ => None,
        };
        op_cache.or_else(|| {
            (self.enable_caching && matches!(op, Operation::Index | Operation::Get))
                .then(|| CachePolicy { ttl: self.cache_timeout })
        })
    }

    pub fn before_hooks(&self, op: Operation) -> &[Arc<dyn BeforeHook>] {
        match op {
            Operation::Post => &self.post.before,
            Operation::Put => &self.put.before,
            Operation::Patch => &self.patch.before,
            Operation::Delete => &self.delete.before,
            _ => &[],
        }
    }

    pub fn after_hooks(&self, op: Operation) -> &[Arc<dyn AfterHook>] {
        match op {
            Operation::Post => &self.post.after,
            Operation::Put => &self.put.after,
            Operation::Patch => &self.patch.after,
            Operation::Delete => &self.delete.after,
            _ => &[],
        }
    }

    fn op_settable(&self, op: Operation) -> Option<&Vec<String>> {
        match op {
            Operation::Post => self.post.settable_fields.as_ref(),
            Operation::Put => self.put.settable_fields.as_ref(),
            Operation::Patch => self.patch.settable_fields.as_ref(),
            _ => None,
        }
    }

    fn op_non_settable(&self, op: Operation) -> &[String] {
        match op {
            Operation::Post => &self.post.non_settable_fields,
            Operation::Put => &self.put.non_settable_fields,
            Operation::Patch => &self.patch.non_settable_fields,
            Operation::BatchSave => &self.batch_save.non_settable_fields,
            _ => &[],
        }
    }

    /// Drops write-protected keys in place: the settable allow-list
    /// first (op over entity; batch rows skip it), then non-settable
    /// from op, entity, and model. Silent on both counts.
    pub fn filter_payload(&self, op: Operation, model: &ModelDescriptor, payload: &mut Row) {
        if op != Operation::BatchSave {
            if let Some(allowed) = self.op_settable(op).or(self.settable_fields.as_ref()) {
                payload.retain(|key, _| allowed.iter().any(|a| a == key));
            }
        }
        for field in self
            .op_non_settable(op)
            .iter()
            .chain(&self.non_settable_fields)
            .chain(&model.non_settable_fields)
        {
            payload.remove(field);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldDescriptor;
    use serde_json::json;

    fn task_model() -> ModelDescriptor {
        ModelDescriptor::new("Task", "tasks")
            .field(FieldDescriptor::integer("id"))
            .field(FieldDescriptor::text("title"))
            .field(FieldDescriptor::text("owner"))
            .field(FieldDescriptor::text("internal_code"))
            .non_settable(["internal_code"])
    }

    #[test]
    fn permitted_wins_over_forbidden() {
        let entity = Entity::new("Task", "tasks")
            .permit([Operation::Index, Operation::Get])
            .forbid([Operation::Get]);
        assert_eq!(entity.permits(Operation::Get), Some(true));
        assert_eq!(entity.permits(Operation::Post), Some(false));

        let entity = Entity::new("Task", "tasks").forbid([Operation::Delete]);
        assert_eq!(entity.permits(Operation::Delete), Some(false));
        assert_eq!(entity.permits(Operation::Index), Some(true));

        let entity = Entity::new("Task", "tasks");
        assert_eq!(entity.permits(Operation::Index), None);
    }

    #[test]
    fn payload_filtering_merges_all_levels() {
        let model = task_model();
        let entity = Entity::new("Task", "tasks")
            .non_settable(["owner"])
            .post_op(PostOp {
                settable_fields: Some(vec![
                    "title".to_string(),
                    "owner".to_string(),
                    "internal_code".to_string(),
                ]),
                ..PostOp::default()
            });
        let mut payload = match json!({
            "id": 9,
            "title": "ok",
            "owner": "me",
            "internal_code": "x"
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        entity.filter_payload(Operation::Post, &model, &mut payload);
        assert_eq!(payload.len(), 1);
        assert!(payload.contains_key("title"));
    }

    #[test]
    fn op_shape_overrides_entity_shape() {
        let entity = Entity::new("Task", "tasks")
            .shape(ResponseShape::new().with_attrs(["id"]))
            .get_op(GetOp {
                common: OpCommon {
                    shape: Some(ResponseShape::new().with_attrs(["id", "title"])),
                    ..OpCommon::default()
                },
                ..GetOp::default()
            });
        let get_shape = entity.shape_for(Operation::Get);
        let index_shape = entity.shape_for(Operation::Index);
        assert!(
            matches!(get_shape.attrs, crate::service::serializer::FieldSelection::Explicit(ref a) if a.len() == 2)
        );
        assert!(
            matches!(index_shape.attrs, crate::service::serializer::FieldSelection::Explicit(ref a) if a.len() == 1)
        );
    }

    #[test]
    fn caching_defaults_apply_to_reads_only() {
        let entity = Entity::new("Task", "tasks").cached(Duration::from_secs(60));
        assert!(entity.cache_for(Operation::Get).is_some());
        assert!(entity.cache_for(Operation::Index).is_some());
        assert!(entity.cache_for(Operation::Post).is_none());

        let entity = Entity::new("Task", "tasks").get_op(GetOp {
            cache: Some(CachePolicy::ttl_secs(5)),
            ..GetOp::default()
        });
        assert_eq!(
            entity.cache_for(Operation::Get),
            Some(CachePolicy::ttl_secs(5))
        );
        assert!(entity.cache_for(Operation::Index).is_none());
    }

    #[tokio::test]
    async fn closures_serve_as_checkers_and_hooks() {
        let entity = Entity::new("Task", "tasks")
            .access(|args: &HookArgs<'_>| {
                if args.params.get("token").is_some() {
                    Access::Granted
                } else {
                    Access::Denied("token required".to_string())
                }
            })
            .before_post(|_args: &HookArgs<'_>, payload: &mut Row| {
                payload.insert("title".to_string(), json!("stamped"));
                Ok(HookFlow::Continue)
            });

        let graph = ModelGraph::new([task_model()]);
        let model = graph.model("Task").unwrap().clone();
        let store = crate::store::MemStore::new();
        let params = QueryParams(vec![]);
        let args = HookArgs::new(&store, &graph, &model, "tasks", Operation::Post, &params);

        let checker = entity.access_for(Operation::Post).unwrap();
        assert!(matches!(
            checker.check(&args).await.unwrap(),
            Access::Denied(_)
        ));

        let mut payload = Row::new();
        let flow = entity.before_hooks(Operation::Post)[0]
            .run(&args, &mut payload)
            .await
            .unwrap();
        assert!(matches!(flow, HookFlow::Continue));
        assert_eq!(payload["title"], json!("stamped"));
    }
}
