//! Facade-level tests: JSON in, status codes and JSON out.
//!
//! The core behind the router is built but never started, so submissions
//! are recorded without any sends happening underneath the assertions.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use mailblast::campaign::{Core, CoreOptions};
use mailblast::clock::SystemClock;
use mailblast::kv::MemoryKv;
use mailblast::mail::LogMailer;
use mailblast::store::MemoryStore;

fn router() -> Router {
    let clock = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let kv = Arc::new(MemoryKv::new(clock.clone()));
    let core = Arc::new(Core::new(
        CoreOptions::default(),
        store,
        kv,
        Arc::new(LogMailer),
        clock,
    ));
    mailblast::http::router(core)
}

fn schedule_body(recipients: &[&str]) -> Value {
    json!({
        "subject": "Hi",
        "body": "<p>Hi</p>",
        "recipients": recipients,
        "startTime": "2026-08-02T10:00:00Z",
        "delayMs": 1000,
        "hourlyLimit": 50,
    })
}

fn post_schedule(owner: Option<&str>, body: &Value) -> Request<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri("/emails/schedule")
        .header("content-type", "application/json");
    if let Some(owner) = owner {
        request = request.header("x-user-id", owner);
    }
    request.body(Body::from(body.to_string())).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn schedule_requires_an_owner() {
    let response = router()
        .oneshot(post_schedule(None, &schedule_body(&["a@x.io"])))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn schedule_returns_created_with_receipt() {
    let response = router()
        .oneshot(post_schedule(Some("u1"), &schedule_body(&["a@x.io", "b@x.io"])))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = json_body(response).await;
    assert_eq!(body["totalEmails"], 2);
    assert_eq!(body["createdJobs"], 2);
    assert_eq!(body["status"], "scheduled");
    assert!(body["scheduleId"].is_string());
}

#[tokio::test]
async fn schedule_rejects_bad_recipients_and_timestamps() {
    let response = router()
        .oneshot(post_schedule(Some("u1"), &schedule_body(&["not-an-email"])))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let mut body = schedule_body(&["a@x.io"]);
    body["startTime"] = json!("yesterday-ish");
    let response = router()
        .oneshot(post_schedule(Some("u1"), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["code"], 400);
}

#[tokio::test]
async fn campaign_detail_is_scoped_to_its_owner() {
    let app = router();

    let response = app
        .clone()
        .oneshot(post_schedule(Some("u1"), &schedule_body(&["a@x.io"])))
        .await
        .unwrap();
    let receipt = json_body(response).await;
    let id = receipt["scheduleId"].as_str().unwrap().to_string();

    let get = |owner: &str| {
        Request::builder()
            .uri(format!("/emails/schedule/{id}"))
            .header("x-user-id", owner)
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(get("u1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let detail = json_body(response).await;
    assert_eq!(detail["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(detail["totalCount"], 1);

    let response = app.clone().oneshot(get("someone-else")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn queue_status_and_health_respond() {
    let app = router();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/emails/queue/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = json_body(response).await;
    for field in ["waiting", "active", "delayed", "completed", "failed"] {
        assert!(stats[field].is_number(), "missing {field}");
    }

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
