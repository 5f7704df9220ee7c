//! End-to-end coverage of the JSON-RPC 2.0 contract: notifications, error
//! codes, `tools/call` dispatch and the full submit -> status -> logs path,
//! all driven in-process with `tower::ServiceExt::oneshot`.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use buildpilot_api::AppState;
use buildpilot_config::Config;
use buildpilot_engine::Coordinator;
use buildpilot_scheduler::fake::FakeScheduler;
use buildpilot_store::fake::FakeRecordStore;
use buildpilot_webhook::WebhookNotifier;
use clap::Parser;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn app() -> axum::Router {
    let config = Arc::new(Config::parse_from(["buildpilot-server"]));
    let store = Arc::new(FakeRecordStore::new());
    let scheduler = Arc::new(FakeScheduler::new());
    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        scheduler.clone(),
        Arc::new(WebhookNotifier::new()),
        config.clone(),
    ));
    let state = AppState::new(coordinator, config, store, scheduler);
    buildpilot_api::routes::router(state)
}

async fn rpc(app: &axum::Router, body: Value) -> Value {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/rpc")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn job_config() -> Value {
    json!({
        "owner": "acme",
        "repo_url": "https://git.example/acme/app",
        "image_name": "app",
        "image_tags": ["v1"],
        "registry_url": "registry.example.com",
        "registry_credentials_ref": "secret/registry/default",
    })
}

#[tokio::test]
async fn submit_then_status_reaches_succeeded() {
    let app = app();
    let submitted = rpc(
        &app,
        json!({ "jsonrpc": "2.0", "id": 1, "method": "submitJob", "params": job_config() }),
    )
    .await;
    let job_id = submitted["result"]["job_id"].as_str().unwrap();

    let mut status = json!(null);
    for _ in 0..50 {
        status = rpc(
            &app,
            json!({ "jsonrpc": "2.0", "id": 2, "method": "getStatus", "params": { "job_id": job_id } }),
        )
        .await;
        if status["result"]["status"] == "SUCCEEDED" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status["result"]["status"], "SUCCEEDED");

    let logs = rpc(
        &app,
        json!({ "jsonrpc": "2.0", "id": 3, "method": "getLogs", "params": { "job_id": job_id } }),
    )
    .await;
    assert!(!logs["result"]["logs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn missing_registry_url_is_a_validation_error() {
    let app = app();
    let mut config = job_config();
    config.as_object_mut().unwrap().remove("registry_url");
    let response = rpc(
        &app,
        json!({ "jsonrpc": "2.0", "id": 1, "method": "submitJob", "params": config }),
    )
    .await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn notification_without_id_gets_no_envelope() {
    let app = app();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/rpc")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "jsonrpc": "2.0", "method": "getHistory", "params": {} }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn malformed_json_is_a_parse_error() {
    let app = app();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/rpc")
                .header("content-type", "application/json")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["error"]["code"], -32700);
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let app = app();
    let response = rpc(&app, json!({ "jsonrpc": "2.0", "id": 1, "method": "doesNotExist" })).await;
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn tools_call_wraps_result_in_content_envelope() {
    let app = app();
    let response = rpc(
        &app,
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": "submitJob", "arguments": job_config() },
        }),
    )
    .await;
    assert_eq!(response["result"]["isError"], false);
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    assert!(serde_json::from_str::<Value>(text).unwrap()["job_id"].is_string());
}

#[tokio::test]
async fn tools_call_reports_domain_errors_as_is_error() {
    let app = app();
    let response = rpc(
        &app,
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": "getStatus", "arguments": { "job_id": "not-a-uuid" } },
        }),
    )
    .await;
    assert_eq!(response["result"]["isError"], true);
}

#[tokio::test]
async fn image_tags_accepts_bare_string_and_json_encoded_list() {
    let app = app();
    let mut bare = job_config();
    bare["image_tags"] = json!("v1");
    let response = rpc(
        &app,
        json!({ "jsonrpc": "2.0", "id": 1, "method": "submitJob", "params": bare }),
    )
    .await;
    assert!(response["result"]["job_id"].is_string());

    let mut encoded = job_config();
    encoded["image_tags"] = json!("[\"v1\",\"v2\"]");
    let response = rpc(
        &app,
        json!({ "jsonrpc": "2.0", "id": 1, "method": "submitJob", "params": encoded }),
    )
    .await;
    assert!(response["result"]["job_id"].is_string());
}

#[tokio::test]
async fn healthz_reports_ok() {
    let app = app();
    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
