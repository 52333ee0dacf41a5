use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use crudkit::{
    ApiError, CommandOutcome, DefaultValue, Entity, EntityRouter, FieldDescriptor, HookArgs,
    HookFlow, MemStore, ModelDescriptor, ModelGraph, Operation, PatchCommand, RelationDescriptor,
    RouterConfig, Row,
};
use serde_json::{json, Value};
use tower::ServiceExt;

#[tokio::test]
async fn create_read_update_delete_cycle() {
    let app = mount(RouterConfig::default(), vec![user_entity(), task_entity()]);

    let created = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/users",
            json!({"name": "alice", "email": "alice@example.com"}),
        ))
        .await
        .expect("create user");
    assert_eq!(created.status(), StatusCode::OK);
    let body = decode_json(created).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["result"]["id"], 1);
    assert_eq!(body["result"]["email"], "alice@example.com");

    let created = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/tasks",
            json!({"title": "write the report", "user_id": 1}),
        ))
        .await
        .expect("create task");
    let body = decode_json(created).await;
    assert_eq!(body["result"]["done"], false);

    let fetched = app
        .clone()
        .oneshot(get_request("/tasks/1"))
        .await
        .expect("get task");
    assert_eq!(fetched.status(), StatusCode::OK);
    let body = decode_json(fetched).await;
    assert_eq!(body["result"]["title"], "write the report");

    let updated = app
        .clone()
        .oneshot(json_request(
            Method::PUT,
            "/tasks/1",
            json!({"title": "send the report"}),
        ))
        .await
        .expect("put task");
    let body = decode_json(updated).await;
    assert_eq!(body["result"]["title"], "send the report");
    // Fields absent from the body keep their stored values.
    assert_eq!(body["result"]["done"], false);
    assert_eq!(body["result"]["user_id"], 1);

    let patched = app
        .clone()
        .oneshot(json_request(Method::PATCH, "/tasks/1", json!({"done": true})))
        .await
        .expect("patch task");
    let body = decode_json(patched).await;
    assert_eq!(body["result"]["done"], true);

    let deleted = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri("/tasks/1")
                .body(Body::empty())
                .expect("delete request"),
        )
        .await
        .expect("delete task");
    assert_eq!(deleted.status(), StatusCode::OK);
    let body = decode_json(deleted).await;
    assert_eq!(body["status"], "success");

    let missing = app
        .clone()
        .oneshot(get_request("/tasks/1"))
        .await
        .expect("get deleted task");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let body = decode_json(missing).await;
    assert_eq!(body["status"], "failure");
    assert_eq!(body["error"], "Resource not found");
}

#[tokio::test]
async fn post_rejects_missing_required_fields() {
    let app = mount(RouterConfig::default(), vec![user_entity(), task_entity()]);

    let response = app
        .clone()
        .oneshot(json_request(Method::POST, "/tasks", json!({"user_id": 1})))
        .await
        .expect("invalid create");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = decode_json(response).await;
    assert_eq!(body["status"], "failure");
    assert!(body["error"]["title"].is_array());
}

#[tokio::test]
async fn put_leaves_required_fields_optional() {
    let app = mount(RouterConfig::default(), vec![user_entity(), task_entity()]);
    seed_task(&app, "draft", None).await;

    let response = app
        .clone()
        .oneshot(json_request(Method::PUT, "/tasks/1", json!({"done": true})))
        .await
        .expect("partial update");
    assert_eq!(response.status(), StatusCode::OK);
    let body = decode_json(response).await;
    assert_eq!(body["result"]["title"], "draft");
    assert_eq!(body["result"]["done"], true);
}

#[tokio::test]
async fn unknown_body_fields_are_rejected_unless_configured() {
    let strict = mount(RouterConfig::default(), vec![user_entity(), task_entity()]);
    let response = strict
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/tasks",
            json!({"title": "a", "color": "red"}),
        ))
        .await
        .expect("strict create");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = decode_json(response).await;
    assert!(body["error"]["color"].is_array());

    let lax = mount(
        RouterConfig::default().allow_unknown_fields(),
        vec![user_entity(), task_entity()],
    );
    let response = lax
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/tasks",
            json!({"title": "a", "color": "red"}),
        ))
        .await
        .expect("lax create");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn non_settable_fields_are_dropped_silently() {
    let app = mount(
        RouterConfig::default(),
        vec![user_entity(), task_entity().non_settable(["done"])],
    );

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/tasks",
            json!({"title": "sneaky", "done": true}),
        ))
        .await
        .expect("create with non-settable");
    assert_eq!(response.status(), StatusCode::OK);
    let body = decode_json(response).await;
    // The key is ignored, not rejected; the column default wins.
    assert_eq!(body["result"]["done"], false);
}

#[tokio::test]
async fn multi_id_get_maps_each_id_to_its_own_outcome() {
    let app = mount(RouterConfig::default(), vec![user_entity(), task_entity()]);
    seed_task(&app, "one", None).await;
    seed_task(&app, "two", None).await;

    let response = app
        .clone()
        .oneshot(get_request("/tasks/%5B1,2,99%5D"))
        .await
        .expect("multi get");
    assert_eq!(response.status(), StatusCode::OK);
    let body = decode_json(response).await;
    assert_eq!(body["status"], "partial_success");
    assert_eq!(body["result"]["1"]["status"], "success");
    assert_eq!(body["result"]["1"]["result"]["title"], "one");
    assert_eq!(body["result"]["2"]["status"], "success");
    assert_eq!(body["result"]["99"]["status"], "failure");
}

#[tokio::test]
async fn ret_param_returns_the_related_object() {
    let app = mount(RouterConfig::default(), vec![user_entity(), task_entity()]);
    let created = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/users",
            json!({"name": "bob", "email": "bob@example.com"}),
        ))
        .await
        .expect("create user");
    assert_eq!(decode_json(created).await["status"], "success");

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/tasks?_ret=user",
            json!({"title": "call bob", "user_id": 1}),
        ))
        .await
        .expect("create with _ret");
    assert_eq!(response.status(), StatusCode::OK);
    let body = decode_json(response).await;
    assert_eq!(body["result"]["email"], "bob@example.com");
    assert!(body["result"].get("title").is_none());
}

#[tokio::test]
async fn patch_command_dispatches_on_cmd_key() {
    let app = mount(
        RouterConfig::default(),
        vec![
            user_entity(),
            task_entity().patch_command("complete", CompleteTask),
        ],
    );
    seed_task(&app, "close me", None).await;

    let response = app
        .clone()
        .oneshot(json_request(Method::PATCH, "/tasks/1", json!({"cmd": "complete"})))
        .await
        .expect("patch cmd");
    assert_eq!(response.status(), StatusCode::OK);
    let body = decode_json(response).await;
    assert_eq!(body["result"]["done"], true);

    let again = app
        .clone()
        .oneshot(json_request(Method::PATCH, "/tasks/1", json!({"cmd": "complete"})))
        .await
        .expect("patch cmd twice");
    assert_eq!(again.status(), StatusCode::BAD_REQUEST);
    let body = decode_json(again).await;
    assert_eq!(body["error"], "task is already done");

    let unknown = app
        .clone()
        .oneshot(json_request(Method::PATCH, "/tasks/1", json!({"cmd": "explode"})))
        .await
        .expect("unknown cmd");
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn forbidden_operations_never_get_routes() {
    let app = mount(
        RouterConfig::default().permit([Operation::Index, Operation::Post]),
        vec![user_entity(), task_entity()],
    );
    seed_task(&app, "locked", None).await;

    // No handler is mounted on /tasks/:id at all, so the fallback answers.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri("/tasks/1")
                .body(Body::empty())
                .expect("delete request"),
        )
        .await
        .expect("forbidden delete");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = decode_json(response).await;
    assert_eq!(body["status"], "failure");

    // /tasks exists for GET and POST; other methods are rejected per method.
    let response = app
        .clone()
        .oneshot(json_request(Method::PUT, "/tasks", json!({})))
        .await
        .expect("put on collection");
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn entity_permission_overrides_router_default() {
    let app = mount(
        RouterConfig::default().forbid([Operation::Delete]),
        vec![
            user_entity(),
            task_entity().permit([
                Operation::Index,
                Operation::Get,
                Operation::Post,
                Operation::Delete,
            ]),
        ],
    );
    seed_task(&app, "deletable", None).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri("/tasks/1")
                .body(Body::empty())
                .expect("delete request"),
        )
        .await
        .expect("entity-permitted delete");
    assert_eq!(response.status(), StatusCode::OK);

    // Users fall back to the router default and lose their delete route.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri("/users/1")
                .body(Body::empty())
                .expect("delete request"),
        )
        .await
        .expect("router-forbidden delete");
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn attrs_and_rels_overrides_shape_the_result() {
    let app = mount(RouterConfig::default(), vec![user_entity(), task_entity()]);
    let created = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/users",
            json!({"name": "carol", "email": "carol@example.com"}),
        ))
        .await
        .expect("create user");
    assert_eq!(created.status(), StatusCode::OK);
    seed_task(&app, "shaped", Some(1)).await;

    let response = app
        .clone()
        .oneshot(get_request("/tasks/1?attrs=title"))
        .await
        .expect("attrs get");
    let body = decode_json(response).await;
    assert_eq!(body["result"], json!({"title": "shaped"}));

    let response = app
        .clone()
        .oneshot(get_request("/tasks/1?attrs=none&rels=user:email"))
        .await
        .expect("pluck get");
    let body = decode_json(response).await;
    assert_eq!(body["result"], json!({"user": "carol@example.com"}));

    let response = app
        .clone()
        .oneshot(get_request("/tasks/1?expand=user"))
        .await
        .expect("expand get");
    let body = decode_json(response).await;
    assert_eq!(body["result"]["user"]["name"], "carol");

    let response = app
        .clone()
        .oneshot(get_request("/tasks/1?attrs=bogus"))
        .await
        .expect("bad attrs get");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn mount_path_prefixes_every_route() {
    let app = mount(RouterConfig::new("/api"), vec![user_entity(), task_entity()]);

    let response = app
        .clone()
        .oneshot(json_request(Method::POST, "/api/tasks", json!({"title": "hi"})))
        .await
        .expect("prefixed create");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get_request("/tasks"))
        .await
        .expect("unprefixed request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn before_hook_can_rewrite_the_payload() {
    let app = mount(
        RouterConfig::default(),
        vec![user_entity(), task_entity().before_post(trim_title)],
    );

    let response = app
        .clone()
        .oneshot(json_request(Method::POST, "/tasks", json!({"title": "  padded  "})))
        .await
        .expect("hooked create");
    let body = decode_json(response).await;
    assert_eq!(body["result"]["title"], "padded");
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

fn trim_title(_args: &HookArgs<'_>, payload: &mut Row) -> Result<HookFlow, ApiError> {
    if let Some(Value::String(title)) = payload.get("title") {
        let trimmed = title.trim().to_string();
        payload.insert("title".into(), Value::String(trimmed));
    }
    Ok(HookFlow::Continue)
}

fn graph() -> ModelGraph {
    ModelGraph::new([
        ModelDescriptor::new("User", "users")
            .field(FieldDescriptor::integer("id").default_value(DefaultValue::AutoIncrement))
            .field(FieldDescriptor::text("name"))
            .field(FieldDescriptor::text("email").required())
            .relation(RelationDescriptor::to_many("tasks", "Task", "id", "user_id")),
        ModelDescriptor::new("Task", "tasks")
            .field(FieldDescriptor::integer("id").default_value(DefaultValue::AutoIncrement))
            .field(FieldDescriptor::text("title").required())
            .field(
                FieldDescriptor::boolean("done")
                    .default_value(DefaultValue::Literal(json!(false))),
            )
            .field(FieldDescriptor::integer("user_id"))
            .relation(RelationDescriptor::to_one("user", "User", "user_id", "id")),
    ])
}

fn user_entity() -> Entity {
    Entity::new("User", "users")
}

fn task_entity() -> Entity {
    Entity::new("Task", "tasks")
}

fn mount(config: RouterConfig, entities: Vec<Entity>) -> Router {
    let mut router = EntityRouter::new(config);
    for entity in entities {
        router = router.register(entity);
    }
    let (app, _state) = router
        .mount(graph(), Arc::new(MemStore::new()))
        .expect("mount");
    app
}

async fn seed_task(app: &Router, title: &str, user_id: Option<i64>) {
    let mut body = json!({"title": title});
    if let Some(user_id) = user_id {
        body["user_id"] = json!(user_id);
    }
    let response = app
        .clone()
        .oneshot(json_request(Method::POST, "/tasks", body))
        .await
        .expect("seed task");
    assert_eq!(response.status(), StatusCode::OK);
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

async fn decode_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body");
    serde_json::from_slice(&bytes).expect("json body")
}
