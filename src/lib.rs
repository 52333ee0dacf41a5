//! Crudkit: declarative CRUD route generation over a relational model
//! graph. Register entities against an `EntityRouter`, mount it over a
//! store, and serve the result with axum.

pub mod cache;
pub mod entity;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod migration;
pub mod model;
pub mod response;
mod routes;
pub mod service;
pub mod sql;
pub mod state;
pub mod store;
pub mod util;

pub use entity::{
    Access, AccessChecker, AfterHook, BeforeHook, CommandOutcome, Entity, HookArgs, HookFlow,
    ObjectGetter, Operation, PatchCommand,
};
pub use error::{ApiError, ConfigError, ValidationErrors};
pub use jobs::{JobRecord, JobStatus};
pub use migration::apply_migrations;
pub use model::{
    DefaultValue, EntityRouter, EntityRuntime, FieldDescriptor, FieldType, InputSchema,
    ModelDescriptor, ModelGraph, PolymorphicSpec, RelationDescriptor, RelationKind, RouteRegistry,
    RouterConfig,
};
pub use response::{ApiResponse, ApiStatus};
pub use service::{FieldSelection, RelShape, ResponseShape};
pub use state::AppState;
pub use store::{ensure_database_exists, DataStore, MemStore, PgStore, Row, StoreError, StoreQuery};
