//! Stripe webhook endpoint and admin webhook operations
//!
//! The endpoint answers 200 for every delivery that reached the event log,
//! including handler failures; those stay in the log for replay instead of
//! being pushed back onto Stripe's redelivery schedule.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use congregate_billing::{EventLogFilter, WebhookEventRecord, WebhookReplayResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "stripe-signature";
const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let report = state.billing.webhooks.receive(&body, signature).await?;

    tracing::debug!(
        event_id = %report.event_id,
        event_type = %report.event_type,
        success = report.outcome.success,
        "Stripe webhook acknowledged"
    );

    Ok(Json(json!({ "received": true })))
}

// =============================================================================
// Admin
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListWebhooksQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct WebhookListResponse {
    pub webhooks: Vec<WebhookEventRecord>,
    pub limit: i64,
    pub offset: i64,
}

pub async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListWebhooksQuery>,
) -> ApiResult<Json<WebhookListResponse>> {
    let filter = match query.status.as_deref() {
        Some(raw) => raw
            .parse::<EventLogFilter>()
            .map_err(|e| ApiError::Validation(e.to_string()))?,
        None => EventLogFilter::All,
    };
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(ApiError::Validation(format!(
            "limit must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }
    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::Validation("offset must not be negative".to_string()));
    }

    let webhooks = state
        .billing
        .webhooks
        .list_webhooks(filter, limit, offset)
        .await?;

    Ok(Json(WebhookListResponse {
        webhooks,
        limit,
        offset,
    }))
}

pub async fn replay_webhook(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<WebhookReplayResult>> {
    let result = state.billing.webhooks.replay_webhook(&event_id).await?;

    tracing::info!(
        stripe_event_id = %event_id,
        success = result.success,
        "Admin replayed webhook"
    );

    Ok(Json(result))
}

pub async fn reset_webhook(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.billing.webhooks.reset_stuck_webhook(&event_id).await?;

    Ok(Json(json!({
        "reset": true,
        "stripe_event_id": event_id,
    })))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use congregate_billing::store::FailPoint;
    use congregate_billing::{sign_payload, MemoryBillingStore, RetryPolicy, StripeConfig};
    use serde_json::json;
    use time::OffsetDateTime;
    use tower::ServiceExt;

    use crate::{config::Config, routes::create_router, state::AppState};

    const SECRET: &str = "whsec_route_tests";
    const ADMIN_TOKEN: &str = "admin-secret-token";

    fn app_with(
        store: &Arc<MemoryBillingStore>,
        webhook_secret: Option<&str>,
        admin_token: Option<&str>,
    ) -> Router {
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            database_url: "postgres://localhost/unused".to_string(),
            stripe: StripeConfig {
                secret_key: None,
                webhook_secret: webhook_secret.map(str::to_string),
            },
            admin_api_token: admin_token.map(str::to_string),
            retry_policy: RetryPolicy::default(),
            run_migrations: false,
        };
        create_router(AppState::new(config, store.clone()))
    }

    fn app(store: &Arc<MemoryBillingStore>) -> Router {
        app_with(store, Some(SECRET), Some(ADMIN_TOKEN))
    }

    fn unknown_event(id: &str) -> Vec<u8> {
        json!({
            "id": id,
            "object": "event",
            "type": "customer.created",
            "created": 1_700_000_000,
            "livemode": false,
            "data": { "object": { "id": "cus_1", "email": "member@example.org" } }
        })
        .to_string()
        .into_bytes()
    }

    fn delivery(payload: Vec<u8>, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/webhooks/stripe")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        builder.body(Body::from(payload)).unwrap()
    }

    fn sign(secret: &str, payload: &[u8]) -> String {
        sign_payload(secret, OffsetDateTime::now_utc().unix_timestamp(), payload).unwrap()
    }

    fn admin(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn signed_delivery_is_acknowledged() {
        let store = Arc::new(MemoryBillingStore::new());
        let payload = unknown_event("evt_1");
        let signature = sign(SECRET, &payload);

        let response = app(&store)
            .oneshot(delivery(payload, Some(signature)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "received": true }));
        assert_eq!(store.events().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_signature_returns_bad_request() {
        let store = Arc::new(MemoryBillingStore::new());

        let response = app(&store)
            .oneshot(delivery(unknown_event("evt_1"), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(store.write_count().await, 0);
    }

    #[tokio::test]
    async fn forged_signature_returns_unauthorized() {
        let store = Arc::new(MemoryBillingStore::new());
        let payload = unknown_event("evt_1");
        let signature = sign("whsec_someone_else", &payload);

        let response = app(&store)
            .oneshot(delivery(payload, Some(signature)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(store.write_count().await, 0);
    }

    #[tokio::test]
    async fn missing_secret_fails_closed() {
        let store = Arc::new(MemoryBillingStore::new());
        let payload = unknown_event("evt_1");
        let signature = sign(SECRET, &payload);

        let response = app_with(&store, None, None)
            .oneshot(delivery(payload, Some(signature)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Internal server error");
        assert_eq!(store.write_count().await, 0);
    }

    #[tokio::test]
    async fn event_log_outage_returns_server_error() {
        let store = Arc::new(MemoryBillingStore::new());
        store.fail_on(FailPoint::InsertEvent).await;
        let payload = unknown_event("evt_1");
        let signature = sign(SECRET, &payload);

        let response = app(&store)
            .oneshot(delivery(payload, Some(signature)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn handler_failure_is_still_acknowledged() {
        let store = Arc::new(MemoryBillingStore::new());
        // No plan exists for this price, so the handler fails.
        let payload = json!({
            "id": "evt_sub",
            "type": "customer.subscription.created",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "sub_1",
                "status": "active",
                "items": { "data": [{ "price": { "id": "price_missing" } }] }
            } }
        })
        .to_string()
        .into_bytes();
        let signature = sign(SECRET, &payload);

        let response = app(&store)
            .oneshot(delivery(payload, Some(signature)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let logged = &store.events().await[0];
        assert_eq!(logged.status(), "failed");
    }

    #[tokio::test]
    async fn admin_routes_require_token() {
        let store = Arc::new(MemoryBillingStore::new());

        let response = app(&store)
            .oneshot(admin("GET", "/api/admin/webhooks", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(&store)
            .oneshot(admin("GET", "/api/admin/webhooks", Some("wrong-token")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_routes_absent_without_token_config() {
        let store = Arc::new(MemoryBillingStore::new());

        let response = app_with(&store, Some(SECRET), None)
            .oneshot(admin("GET", "/api/admin/webhooks", Some(ADMIN_TOKEN)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_lists_webhooks_by_status() {
        let store = Arc::new(MemoryBillingStore::new());
        for id in ["evt_1", "evt_2"] {
            let payload = unknown_event(id);
            let signature = sign(SECRET, &payload);
            app(&store)
                .oneshot(delivery(payload, Some(signature)))
                .await
                .unwrap();
        }

        let response = app(&store)
            .oneshot(admin(
                "GET",
                "/api/admin/webhooks?status=processed&limit=1",
                Some(ADMIN_TOKEN),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["limit"], 1);
        assert_eq!(body["webhooks"].as_array().unwrap().len(), 1);
        assert_eq!(body["webhooks"][0]["stripe_event_id"], "evt_2");

        let response = app(&store)
            .oneshot(admin(
                "GET",
                "/api/admin/webhooks?status=bogus",
                Some(ADMIN_TOKEN),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_list_rejects_bad_paging() {
        let store = Arc::new(MemoryBillingStore::new());

        for uri in [
            "/api/admin/webhooks?limit=-1",
            "/api/admin/webhooks?limit=0",
            "/api/admin/webhooks?limit=501",
            "/api/admin/webhooks?offset=-5",
        ] {
            let response = app(&store)
                .oneshot(admin("GET", uri, Some(ADMIN_TOKEN)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn admin_replay_and_reset_errors() {
        let store = Arc::new(MemoryBillingStore::new());

        // No STRIPE_SECRET_KEY configured
        let response = app(&store)
            .oneshot(admin(
                "POST",
                "/api/admin/webhooks/evt_1/replay",
                Some(ADMIN_TOKEN),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = app(&store)
            .oneshot(admin(
                "POST",
                "/api/admin/webhooks/evt_1/reset",
                Some(ADMIN_TOKEN),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_configuration() {
        let store = Arc::new(MemoryBillingStore::new());

        let response = app_with(&store, None, None)
            .oneshot(admin("GET", "/health", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["webhooks_configured"], false);
    }
}
