use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use crudkit::{
    DefaultValue, Entity, EntityRouter, FieldDescriptor, MemStore, ModelDescriptor, ModelGraph,
    RelationDescriptor, RouterConfig,
};
use serde_json::{json, Value};
use tower::ServiceExt;

#[tokio::test]
async fn equality_filters_coerce_to_column_types() {
    let app = seeded_app().await;

    let body = list(&app, "/tasks?done=true").await;
    let titles = title_set(&body);
    assert_eq!(titles, vec!["buy milk"]);

    let body = list(&app, "/tasks?user_id=2").await;
    assert_eq!(title_set(&body), vec!["call mom"]);
}

#[tokio::test]
async fn comparison_operators_work_in_key_and_value_position() {
    let app = seeded_app().await;

    // Operator encoded as a value prefix.
    let body = list(&app, "/tasks?id=%3E%3D3").await;
    assert_eq!(title_set(&body), vec!["call mom", "orphaned"]);

    // Operator trailing the key.
    let body = list(&app, "/tasks?id%3C=3").await;
    assert_eq!(title_set(&body), vec!["write report", "buy milk"]);
}

#[tokio::test]
async fn contains_filter_is_case_insensitive_and_text_only() {
    let app = seeded_app().await;

    let body = list(&app, "/tasks?title~=REPORT").await;
    assert_eq!(title_set(&body), vec!["write report"]);

    let response = app
        .clone()
        .oneshot(get_request("/tasks?id~=1"))
        .await
        .expect("contains on integer");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn none_spelling_matches_null_and_not_null() {
    let app = seeded_app().await;

    let body = list(&app, "/tasks?user_id=none").await;
    assert_eq!(title_set(&body), vec!["orphaned"]);

    let body = list(&app, "/tasks?user_id=%21").await;
    let titles = title_set(&body);
    assert_eq!(titles.len(), 3);
    assert!(!titles.contains(&"orphaned".to_string()));
}

#[tokio::test]
async fn dotted_paths_filter_through_relations() {
    let app = seeded_app().await;

    let body = list(&app, "/tasks?user.name=alice").await;
    assert_eq!(title_set(&body), vec!["write report", "buy milk"]);

    // From the to-many side: users who have at least one done task.
    let body = list(&app, "/users?tasks.done=true").await;
    let names: Vec<&str> = body["result"]
        .as_array()
        .expect("users array")
        .iter()
        .filter_map(|u| u["name"].as_str())
        .collect();
    assert_eq!(names, vec!["alice"]);
}

#[tokio::test]
async fn unknown_filter_keys_are_ignored() {
    let app = seeded_app().await;
    let body = list(&app, "/tasks?flavor=vanilla").await;
    assert_eq!(body["result"].as_array().expect("tasks array").len(), 4);
}

#[tokio::test]
async fn f_tree_builds_or_filters_and_rejects_unknown_fields() {
    let app = seeded_app().await;

    let tree = json!({"or": [
        {"field": "title", "op": "~", "value": "milk"},
        {"field": "user.name", "value": "bob"}
    ]});
    let encoded: String = url_escape(&tree.to_string());
    let body = list(&app, &format!("/tasks?_f={}", encoded)).await;
    assert_eq!(title_set(&body), vec!["buy milk", "call mom"]);

    let bad = json!({"field": "flavor", "value": "vanilla"});
    let response = app
        .clone()
        .oneshot(get_request(&format!(
            "/tasks?_f={}",
            url_escape(&bad.to_string())
        )))
        .await
        .expect("bad tree");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn ordering_limit_and_offset() {
    let app = seeded_app().await;

    let body = list(&app, "/tasks?orderby=title&sort=desc&limit=2").await;
    assert_eq!(title_set(&body), vec!["write report", "orphaned"]);

    let body = list(&app, "/tasks?orderby=title&offset=3").await;
    assert_eq!(title_set(&body), vec!["write report"]);

    let response = app
        .clone()
        .oneshot(get_request("/tasks?orderby=flavor"))
        .await
        .expect("order by unknown");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pagination_carries_meta_and_rejects_out_of_range_pages() {
    let app = seeded_app().await;

    let body = list(&app, "/tasks?page=2&per_page=3").await;
    assert_eq!(body["result"].as_array().expect("page rows").len(), 1);
    assert_eq!(body["total_pages"], 2);
    assert_eq!(body["total_items"], 4);
    assert_eq!(body["curr_page_first_item_index"], 4);
    assert_eq!(body["curr_page_last_item_index"], 4);

    let response = app
        .clone()
        .oneshot(get_request("/tasks?page=9&per_page=3"))
        .await
        .expect("page out of range");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = decode_json(response).await;
    assert_eq!(body["status"], "failure");
    assert_eq!(body["error"], "PAGE_NOT_FOUND");
    assert_eq!(body["total_pages"], 2);
}

#[tokio::test]
async fn count_only_returns_the_count() {
    let app = seeded_app().await;
    let body = list(&app, "/tasks?count_only=true&done=false").await;
    assert_eq!(body["result"], 3);
}

#[tokio::test]
async fn group_by_buckets_rows_by_value() {
    let app = seeded_app().await;
    let body = list(&app, "/tasks?groupby=done").await;
    let result = body["result"].as_object().expect("grouped result");
    assert_eq!(result["true"].as_array().expect("done bucket").len(), 1);
    assert_eq!(result["false"].as_array().expect("open bucket").len(), 3);
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

/// Two users and four tasks; ids are assigned in insertion order.
async fn seeded_app() -> Router {
    let (app, _state) = EntityRouter::new(RouterConfig::default())
        .register(Entity::new("User", "users"))
        .register(Entity::new("Task", "tasks"))
        .mount(graph(), Arc::new(MemStore::new()))
        .expect("mount");

    for body in [
        json!({"name": "alice", "email": "alice@example.com"}),
        json!({"name": "bob", "email": "bob@example.com"}),
    ] {
        let response = app
            .clone()
            .oneshot(json_request(Method::POST, "/users", body))
            .await
            .expect("seed user");
        assert_eq!(response.status(), StatusCode::OK);
    }
    for body in [
        json!({"title": "write report", "user_id": 1}),
        json!({"title": "buy milk", "user_id": 1, "done": true}),
        json!({"title": "call mom", "user_id": 2}),
        json!({"title": "orphaned"}),
    ] {
        let response = app
            .clone()
            .oneshot(json_request(Method::POST, "/tasks", body))
            .await
            .expect("seed task");
        assert_eq!(response.status(), StatusCode::OK);
    }
    app
}

async fn list(app: &Router, uri: &str) -> Value {
    let response = app
        .clone()
        .oneshot(get_request(uri))
        .await
        .expect("list response");
    assert_eq!(response.status(), StatusCode::OK, "{}", uri);
    decode_json(response).await
}

fn title_set(body: &Value) -> Vec<String> {
    body["result"]
        .as_array()
        .expect("result array")
        .iter()
        .filter_map(|row| row["title"].as_str())
        .map(str::to_string)
        .collect()
}

fn url_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
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
