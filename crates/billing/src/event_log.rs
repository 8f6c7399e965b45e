//! Durable log of received Stripe events
//!
//! Every verified delivery gets one row, keyed by Stripe's event id, holding
//! the sanitized payload. The row is inserted before any handler runs and
//! marked once the outcome is known.

use std::sync::Arc;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::error::BillingResult;
use crate::models::{EventLogQuery, WebhookEventRecord};
use crate::sanitize::SanitizedPayload;
use crate::store::BillingStore;

/// Retries after the first failed outcome write.
const MARK_RETRIES: usize = 1;

#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn BillingStore>,
}

impl EventLog {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Insert the received event. Returns `true` on first delivery and
    /// `false` when Stripe redelivered an event already in the log.
    pub async fn record_received(&self, payload: &SanitizedPayload) -> BillingResult<bool> {
        let inserted = self.store.insert_event(payload).await.map_err(|e| {
            tracing::error!(
                event_id = %payload.id,
                event_type = %payload.event_type,
                error = %e,
                "Failed to record webhook event"
            );
            e
        })?;

        if !inserted {
            tracing::info!(
                event_id = %payload.id,
                event_type = %payload.event_type,
                "Webhook event already logged (redelivery)"
            );
        }
        Ok(inserted)
    }

    /// Record the processing outcome. Never fails the caller: the write is
    /// retried once and then only logged.
    pub async fn mark_processed(&self, event_id: &str, success: bool, error: Option<&str>) {
        let strategy = ExponentialBackoff::from_millis(50)
            .map(jitter)
            .take(MARK_RETRIES);

        let result = Retry::start(strategy, move || async move {
            let attempt = self
                .store
                .mark_event_processed(event_id, success, error)
                .await;
            if let Err(e) = &attempt {
                tracing::warn!(
                    event_id = %event_id,
                    error = %e,
                    "Failed to update webhook event outcome, retrying..."
                );
            }
            attempt
        })
        .await;

        match result {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    event_id = %event_id,
                    "No webhook event row to mark; outcome not recorded"
                );
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event_id,
                    success = success,
                    error_message = ?error,
                    final_error = %e,
                    "CRITICAL: Failed to record webhook outcome after retry"
                );
            }
        }
    }

    pub async fn get(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        self.store.get_event(event_id).await
    }

    pub async fn list(&self, query: EventLogQuery) -> BillingResult<Vec<WebhookEventRecord>> {
        self.store.list_events(query).await
    }
}
