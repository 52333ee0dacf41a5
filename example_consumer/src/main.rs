//! Example consumer: a separate Rust project that uses crudkit as a dependency.
//!
//! A small todo-list backend. Users own tasks; tasks can be completed
//! through a `cmd` PATCH. Run from repo root: `cargo run -p example-consumer`
//! or from this directory: `cargo run`.

use std::sync::Arc;
use std::time::Duration;

use crudkit::{
    apply_migrations, ensure_database_exists, ApiError, CommandOutcome, DefaultValue, Entity,
    EntityRouter, FieldDescriptor, HookArgs, HookFlow, ModelDescriptor, ModelGraph, PatchCommand,
    PgStore, RelationDescriptor, RouterConfig, Row,
};
use serde_json::Value;
use tokio::net::TcpListener;

fn graph() -> ModelGraph {
    ModelGraph::new([
        ModelDescriptor::new("User", "users")
            .field(
                FieldDescriptor::integer("id").default_value(DefaultValue::AutoIncrement),
            )
            .field(
                FieldDescriptor::datetime("created_on").default_value(DefaultValue::Now),
            )
            .field(FieldDescriptor::text("name"))
            .field(FieldDescriptor::text("email").required())
            .relation(RelationDescriptor::to_many("tasks", "Task", "id", "user_id"))
            .non_settable(["created_on"]),
        ModelDescriptor::new("Task", "tasks")
            .field(
                FieldDescriptor::integer("id").default_value(DefaultValue::AutoIncrement),
            )
            .field(
                FieldDescriptor::datetime("created_on").default_value(DefaultValue::Now),
            )
            .field(FieldDescriptor::text("title").required())
            .field(
                FieldDescriptor::boolean("done")
                    .default_value(DefaultValue::Literal(Value::Bool(false))),
            )
            .field(FieldDescriptor::integer("user_id"))
            .relation(RelationDescriptor::to_one("user", "User", "user_id", "id"))
            .non_settable(["created_on"]),
    ])
}

fn trim_title(_args: &HookArgs<'_>, payload: &mut Row) -> Result<HookFlow, ApiError> {
    if let Some(Value::String(title)) = payload.get("title") {
        let trimmed = title.trim().to_string();
        payload.insert("title".into(), Value::String(trimmed));
    }
    Ok(HookFlow::Continue)
}

struct CompleteTask;

#[async_trait::async_trait]
impl PatchCommand for CompleteTask {
    async fn apply(
        &self,
        _args: &HookArgs<'_>,
        row: &Row,
        _payload: &Row,
    ) -> Result<CommandOutcome, ApiError> {
        if row.get("done") == Some(&Value::Bool(true)) {
            return Err(ApiError::BadRequest("task is already done".into()));
        }
        let mut changes = Row::new();
        changes.insert("done".into(), Value::Bool(true));
        Ok(CommandOutcome::Update(changes))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("crudkit=info")),
        )
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/crudkit_demo".into());
    ensure_database_exists(&database_url).await?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    let graph = graph();
    apply_migrations(&pool, &graph).await?;

    let (app, _state) = EntityRouter::new(RouterConfig::new("/api"))
        .register(Entity::new("User", "users").cached(Duration::from_secs(30)))
        .register(
            Entity::new("Task", "tasks")
                .before_post(trim_title)
                .patch_command("complete", CompleteTask),
        )
        .mount(graph, Arc::new(PgStore::new(pool)))?;

    let listener = TcpListener::bind("127.0.0.1:3000").await?;
    let port = listener.local_addr()?.port();
    tracing::info!("Example consumer listening on http://127.0.0.1:{}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
