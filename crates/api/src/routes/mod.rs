//! HTTP routes

pub mod webhooks;

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;

use crate::{error::ApiError, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/api/webhooks/stripe", post(webhooks::stripe_webhook));

    if state.config.admin_api_token.is_some() {
        let admin = Router::new()
            .route("/webhooks", get(webhooks::list_webhooks))
            .route("/webhooks/{event_id}/replay", post(webhooks::replay_webhook))
            .route("/webhooks/{event_id}/reset", post(webhooks::reset_webhook))
            .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));
        router = router.nest("/api/admin", admin);
    }

    router.with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "webhooks_configured": state.billing.webhooks.is_configured(),
    }))
}

/// Bearer-token guard for the admin routes.
pub async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.config.admin_api_token.as_deref() else {
        return ApiError::Unauthorized.into_response();
    };

    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let has_token = provided.is_some();
    let authorized = provided
        .map(|token| bool::from(token.as_bytes().ct_eq(expected.as_bytes())))
        .unwrap_or(false);

    if !authorized {
        tracing::warn!(
            path = %request.uri().path(),
            has_token = has_token,
            "Admin request rejected"
        );
        return ApiError::Unauthorized.into_response();
    }

    next.run(request).await
}
