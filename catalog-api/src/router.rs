use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use common_metrics::setup_metrics_routes;
use lifecycle::BackgroundTasks;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::config::{OriginList, ServiceConfig};
use crate::error::RouterError;
use crate::notify::{deliver, Notification, Notifier};
use crate::rate_limit::{limit_by_ip, IpRateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub tasks: BackgroundTasks,
    pub notifier: Arc<dyn Notifier>,
}

pub fn router(state: AppState) -> Result<Router, RouterError> {
    let config = state.config.clone();

    let mut router = Router::new()
        .route("/v1/healthcheck", get(healthcheck))
        .route("/v1/notifications", post(queue_notification))
        .with_state(state);

    if config.limiter.enabled {
        let limiter = IpRateLimiter::new(config.limiter.rps, config.limiter.burst)?;
        router = router.layer(middleware::from_fn_with_state(limiter, limit_by_ip));
    }

    router = router
        .layer(cors_layer(&config.trusted_origins)?)
        .layer(TraceLayer::new_for_http());

    // Don't install metrics unless asked to
    // Installing a global recorder when the router is built more than once (during tests etc)
    // does not work well.
    if config.export_prometheus {
        router = setup_metrics_routes(router)?;
    }

    Ok(router)
}

fn cors_layer(origins: &OriginList) -> Result<CorsLayer, RouterError> {
    let origins = origins
        .0
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|_| RouterError::InvalidOrigin(origin.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]))
}

async fn healthcheck(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "available",
        "system_info": {
            "environment": state.config.env.as_str(),
            "version": env!("CARGO_PKG_VERSION"),
        }
    }))
}

async fn queue_notification(
    State(state): State<AppState>,
    Json(notification): Json<Notification>,
) -> Response {
    let errors = notification.validate();
    if !errors.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": errors })),
        )
            .into_response();
    }

    let recipient = notification.recipient.clone();
    let notifier = state.notifier.clone();
    state.tasks.spawn("notification", async move {
        if let Err(e) = deliver(notifier.as_ref(), &notification).await {
            error!(error = %e, "giving up on notification");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "message": "notification queued", "recipient": recipient })),
    )
        .into_response()
}
