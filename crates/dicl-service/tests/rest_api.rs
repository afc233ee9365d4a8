//! REST routes over an in-process service

mod common;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::harness;
use dicl_service::api;

fn app() -> Router {
    api::router(Arc::new(harness().service))
}

async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_and_version() {
    let (status, body) = call(app(), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = call(app(), "GET", "/api/v1/version", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "dicl-service");
}

#[tokio::test]
async fn test_ingest_retrieve_and_stats() {
    let app = app();
    let input = json!({"messages": [{"role": "user", "content": "Rust borrows"}]});

    let (status, created) = call(
        app.clone(),
        "POST",
        "/examples",
        Some(json!({
            "function_name": "summarize",
            "variant_name": "dicl",
            "input": input,
            "output": "Borrowing summary",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["partition"]["namespace"], "default");

    let (status, retrieved) = call(
        app.clone(),
        "POST",
        "/retrieve",
        Some(json!({
            "function_name": "summarize",
            "variant_name": "dicl",
            "input": input,
            "k": 5,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let examples = retrieved["examples"].as_array().unwrap();
    assert_eq!(examples.len(), 1);
    assert_eq!(examples[0]["output"], "Borrowing summary");
    assert_eq!(examples[0]["rank"], 0);
    assert!(examples[0].get("embedding").is_none());

    let (status, stats) = call(app, "GET", "/partitions/summarize/dicl/default/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["count"], 1);
    assert_eq!(stats["dimension"], 16);
}

#[tokio::test]
async fn test_inference_round_trip() {
    let (status, body) = call(
        app(),
        "POST",
        "/inference",
        Some(json!({
            "function_name": "summarize",
            "variant_name": "dicl",
            "input": {"messages": [{"role": "user", "content": "hello"}]},
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["variant_name"], "dicl");
    assert_eq!(body["no_examples_retrieved"], true);
    assert_eq!(body["output"]["type"], "chat");
    assert!(body["inference_id"].is_string());
}

#[tokio::test]
async fn test_error_statuses() {
    let (status, body) = call(
        app(),
        "POST",
        "/inference",
        Some(json!({
            "function_name": "missing",
            "input": {"messages": []},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["stage"], "received");

    let (status, _) = call(
        app(),
        "POST",
        "/inference",
        Some(json!({
            "function_name": "summarize",
            "variant_name": "dicl_strict",
            "input": {"messages": [{"role": "user", "content": "hi"}]},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let (status, _) = call(
        app(),
        "POST",
        "/feedback",
        Some(json!({"metric_name": "undefined", "value": 1.0, "inference_id": "0190c0de-0000-7000-8000-000000000000"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_feedback_accepted_and_populate() {
    let app = app();
    let (_, served) = call(
        app.clone(),
        "POST",
        "/inference",
        Some(json!({
            "function_name": "summarize",
            "variant_name": "baseline",
            "input": {"messages": [{"role": "user", "content": "ownership"}]},
        })),
    )
    .await;

    let (status, _) = call(
        app.clone(),
        "POST",
        "/feedback",
        Some(json!({
            "metric_name": "demonstration",
            "value": "Ownership summary",
            "inference_id": served["inference_id"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // Delivery is asynchronous; give the sink task a chance to run
    let mut inserted = 0;
    for _ in 0..50 {
        let (status, report) = call(
            app.clone(),
            "POST",
            "/populate",
            Some(json!({
                "function_name": "summarize",
                "variant_name": "dicl",
                "dedupe": "skip_ingested",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        inserted += report["inserted"].as_u64().unwrap();
        if inserted > 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(inserted, 1);
}

#[tokio::test]
async fn test_batch_upsert_is_atomic() {
    let app = app();
    let example = |embedding: Vec<f32>| {
        json!({
            "id": dicl_common::ExampleId::new(),
            "function_name": "summarize",
            "variant_name": "dicl",
            "namespace": "batch",
            "input": "in",
            "output": "out",
            "embedding": embedding,
        })
    };

    // Mixed dimensions within one partition reject the whole batch
    let (status, _) = call(
        app.clone(),
        "POST",
        "/examples/batch",
        Some(json!([example(vec![1.0; 16]), example(vec![1.0; 8])])),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, stats) = call(app.clone(), "GET", "/partitions/summarize/dicl/batch/stats", None).await;
    assert_eq!(stats["count"], 0);

    let (status, body) = call(
        app,
        "POST",
        "/examples/batch",
        Some(json!([example(vec![1.0; 16]), example(vec![0.5; 16])])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["inserted"], 2);
}

#[tokio::test]
async fn test_batch_upsert_rejects_ids_without_creation_time() {
    let (status, body) = call(
        app(),
        "POST",
        "/examples/batch",
        Some(json!([{
            "id": uuid::Uuid::new_v4(),
            "function_name": "summarize",
            "variant_name": "dicl",
            "namespace": "batch",
            "input": "in",
            "output": "out",
            "embedding": vec![1.0; 16],
        }])),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("UUIDv7"));
}
