//! Liveness endpoint

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{Router, extract::State, http::StatusCode, routing::get};

/// Readiness flag flipped once startup has finished
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.0.store(ready, Ordering::Release);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// 204 once the worker is initialized, 503 before that and during shutdown
async fn healthcheck(State(ready): State<Readiness>) -> StatusCode {
    if ready.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Build the health router
#[must_use]
pub fn router(ready: Readiness) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .with_state(ready)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    async fn status(ready: &Readiness) -> StatusCode {
        router(ready.clone())
            .oneshot(
                Request::builder()
                    .uri("/healthcheck")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn unavailable_until_ready() {
        let ready = Readiness::new();
        assert_eq!(status(&ready).await, StatusCode::SERVICE_UNAVAILABLE);

        ready.set_ready(true);
        assert_eq!(status(&ready).await, StatusCode::NO_CONTENT);

        ready.set_ready(false);
        assert_eq!(status(&ready).await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let response = router(Readiness::new())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
