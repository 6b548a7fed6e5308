//! Health endpoint tests

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use plural_proxy::api::{HealthServer, Readiness};
use tower::ServiceExt;

fn healthcheck() -> Request<Body> {
    Request::builder()
        .uri("/healthcheck")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn healthcheck_reflects_readiness() {
    let ready = Readiness::new();
    let server = HealthServer::new(0, ready.clone());

    let response = server.router().oneshot(healthcheck()).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    ready.set_ready(true);
    let response = server.router().oneshot(healthcheck()).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
