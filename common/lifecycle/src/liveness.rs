//! Liveness probe handler.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// K8s liveness probe handler. Always returns 200: liveness means the process is reachable.
/// A draining process is still alive, so this never flips during shutdown.
#[derive(Clone, Default)]
pub struct LivenessHandler;

impl LivenessHandler {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self) -> LivenessStatus {
        LivenessStatus
    }
}

/// Always-healthy liveness status. Implements [`IntoResponse`] for axum.
pub struct LivenessStatus;

impl IntoResponse for LivenessStatus {
    fn into_response(self) -> Response {
        (StatusCode::OK, "ok").into_response()
    }
}
