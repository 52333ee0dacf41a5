use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use crudkit::entity::BatchSaveOp;
use crudkit::{
    DefaultValue, Entity, EntityRouter, FieldDescriptor, MemStore, ModelDescriptor, ModelGraph,
    RelationDescriptor, RouterConfig,
};
use serde_json::{json, Value};
use tower::ServiceExt;

#[tokio::test]
async fn rows_with_a_primary_key_update_and_the_rest_create() {
    let app = mount(BatchSaveOp::default());
    seed_task(&app, "original").await;

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/batch-save/tasks",
            json!([
                {"id": 1, "title": "renamed"},
                {"title": "fresh"}
            ]),
        ))
        .await
        .expect("batch save");
    assert_eq!(response.status(), StatusCode::OK);
    let body = decode_json(response).await;
    assert_eq!(body["status"], "success");
    let items = body["result"].as_array().expect("batch items");
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["status"], "success");
    assert_eq!(items[0]["result"]["title"], "renamed");
    assert_eq!(items[0]["input"], json!({"id": 1, "title": "renamed"}));
    assert_eq!(items[1]["result"]["id"], 2);

    let listed = decode_json(
        app.clone()
            .oneshot(get_request("/tasks"))
            .await
            .expect("list"),
    )
    .await;
    assert_eq!(listed["result"].as_array().expect("tasks").len(), 2);
}

#[tokio::test]
async fn row_failures_are_isolated_and_aggregate_the_status() {
    let app = mount(BatchSaveOp::default());

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/batch-save/tasks",
            json!([
                {"title": "good"},
                {"title": "bad", "done": "not a bool"}
            ]),
        ))
        .await
        .expect("batch save");
    assert_eq!(response.status(), StatusCode::OK);
    let body = decode_json(response).await;
    assert_eq!(body["status"], "partial_success");
    let items = body["result"].as_array().expect("batch items");
    assert_eq!(items[0]["status"], "success");
    assert_eq!(items[1]["status"], "failure");
    assert!(items[1]["error"]["done"].is_array());
    assert_eq!(items[1]["input"]["title"], "bad");

    // The failed row was never written.
    let listed = decode_json(
        app.clone()
            .oneshot(get_request("/tasks"))
            .await
            .expect("list"),
    )
    .await;
    assert_eq!(listed["result"].as_array().expect("tasks").len(), 1);
}

#[tokio::test]
async fn required_fields_may_be_skipped_in_batch_rows() {
    let app = mount(BatchSaveOp::default());

    // `title` is required on plain POST, but batch rows validate
    // partially so a bare row still creates.
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/batch-save/tasks",
            json!([{"user_id": 1}]),
        ))
        .await
        .expect("batch save");
    let body = decode_json(response).await;
    assert_eq!(body["status"], "success");
}

#[tokio::test]
async fn update_only_and_create_only_guard_rows() {
    let update_only = mount(BatchSaveOp {
        update_only: true,
        ..BatchSaveOp::default()
    });
    let response = update_only
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/batch-save/tasks",
            json!([{"title": "no match"}]),
        ))
        .await
        .expect("update-only batch");
    let body = decode_json(response).await;
    assert_eq!(body["status"], "failure");
    assert_eq!(
        body["result"][0]["error"],
        "No matching instance found"
    );

    let create_only = mount(BatchSaveOp {
        create_only: true,
        ..BatchSaveOp::default()
    });
    seed_task(&create_only, "taken").await;
    let response = create_only
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/batch-save/tasks",
            json!([{"id": 1, "title": "clobber"}]),
        ))
        .await
        .expect("create-only batch");
    let body = decode_json(response).await;
    assert_eq!(body["status"], "failure");
    assert_eq!(
        body["result"][0]["error"],
        "Cannot create a new instance as a matching instance is existing"
    );
}

#[tokio::test]
async fn unique_identifier_fields_turn_matches_into_updates() {
    let (app, _state) = EntityRouter::new(RouterConfig::default())
        .register(Entity::new("User", "users").batch_save_op(BatchSaveOp {
            unique_identifier_fields: vec!["email".to_string()],
            ..BatchSaveOp::default()
        }))
        .register(Entity::new("Task", "tasks"))
        .mount(graph(), Arc::new(MemStore::new()))
        .expect("mount");

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/users",
            json!({"name": "alice", "email": "alice@example.com"}),
        ))
        .await
        .expect("seed user");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/batch-save/users",
            json!([
                {"email": "alice@example.com", "name": "alicia"},
                {"email": "new@example.com", "name": "newcomer"}
            ]),
        ))
        .await
        .expect("batch save");
    let body = decode_json(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["result"][0]["result"]["id"], 1);
    assert_eq!(body["result"][0]["result"]["name"], "alicia");
    assert_eq!(body["result"][1]["result"]["id"], 2);

    let listed = decode_json(
        app.clone()
            .oneshot(get_request("/users"))
            .await
            .expect("list"),
    )
    .await;
    assert_eq!(listed["result"].as_array().expect("users").len(), 2);
}

#[tokio::test]
async fn async_batches_report_through_the_job_endpoint() {
    let app = mount(BatchSaveOp {
        run_async: true,
        ..BatchSaveOp::default()
    });

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/batch-save/tasks",
            json!([{"title": "later"}]),
        ))
        .await
        .expect("async batch");
    assert_eq!(response.status(), StatusCode::OK);
    let body = decode_json(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["result"]["status"], "queued");
    assert_eq!(body["result"]["entity"], "tasks");
    let job_id = body["result"]["id"].as_str().expect("job id").to_string();

    let mut job = Value::Null;
    for _ in 0..100 {
        let response = app
            .clone()
            .oneshot(get_request(&format!("/batch-jobs/{}", job_id)))
            .await
            .expect("job status");
        assert_eq!(response.status(), StatusCode::OK);
        job = decode_json(response).await;
        if job["result"]["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(job["result"]["status"], "completed");
    assert_eq!(job["result"]["result"]["status"], "success");

    let listed = decode_json(
        app.clone()
            .oneshot(get_request("/tasks"))
            .await
            .expect("list"),
    )
    .await;
    assert_eq!(listed["result"][0]["title"], "later");
}

#[tokio::test]
async fn rejects_unknown_job_ids_and_non_array_bodies() {
    let app = mount(BatchSaveOp::default());

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/batch-save/tasks",
            json!({"title": "not a list"}),
        ))
        .await
        .expect("object body");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = decode_json(response).await;
    assert_eq!(body["error"], "batch body must be a json array");

    let response = app
        .clone()
        .oneshot(get_request(
            "/batch-jobs/00000000-0000-0000-0000-000000000000",
        ))
        .await
        .expect("unknown job");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(get_request("/batch-jobs/not-a-uuid"))
        .await
        .expect("malformed job id");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn csv_multipart_uploads_run_the_same_pipeline() {
    let app = mount(BatchSaveOp::default());

    let boundary = "batchboundary";
    let csv = "title,done\r\nfrom csv,true\r\nsecond,\r\n";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"tasks.csv\"\r\nContent-Type: text/csv\r\n\r\n{csv}\r\n--{b}--\r\n",
        b = boundary,
        csv = csv,
    );
    let request = Request::builder()
        .method(Method::POST)
        .uri("/batch-save/tasks")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .expect("multipart request");

    let response = app.clone().oneshot(request).await.expect("csv batch");
    assert_eq!(response.status(), StatusCode::OK);
    let body = decode_json(response).await;
    assert_eq!(body["status"], "success");
    let items = body["result"].as_array().expect("batch items");
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["result"]["done"], true);
    // The empty cell fell away, so the column default applied.
    assert_eq!(items[1]["result"]["done"], false);
}

#[tokio::test]
async fn multipart_flag_fields_override_entity_defaults() {
    let app = mount(BatchSaveOp::default());

    let boundary = "flagboundary";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"update_only\"\r\n\r\ntrue\r\n--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"tasks.csv\"\r\nContent-Type: text/csv\r\n\r\ntitle\r\nnever created\r\n\r\n--{b}--\r\n",
        b = boundary,
    );
    let request = Request::builder()
        .method(Method::POST)
        .uri("/batch-save/tasks")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .expect("multipart request");

    let response = app.clone().oneshot(request).await.expect("flagged batch");
    let body = decode_json(response).await;
    assert_eq!(body["status"], "failure");
    assert_eq!(body["result"][0]["error"], "No matching instance found");
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

fn mount(batch: BatchSaveOp) -> Router {
    let (app, _state) = EntityRouter::new(RouterConfig::default())
        .register(Entity::new("User", "users"))
        .register(Entity::new("Task", "tasks").batch_save_op(batch))
        .mount(graph(), Arc::new(MemStore::new()))
        .expect("mount");
    app
}

async fn seed_task(app: &Router, title: &str) {
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/tasks",
            json!({"title": title}),
        ))
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
