mod common;

use axum::http::Method;
use common::{response_json, TestApp};

#[tokio::test]
async fn liveness_answers_without_touching_the_database() {
    let app = TestApp::new().await;

    let response = app.request_public(Method::GET, "/health", None).await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["status"], "up");
    assert!(body["version"].as_str().is_some());
}

#[tokio::test]
async fn readiness_reports_the_database_check() {
    let app = TestApp::new().await;

    let response = app.request_public(Method::GET, "/health/ready", None).await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["checks"]["database"]["status"], "up");
}
