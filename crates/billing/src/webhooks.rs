//! Stripe webhook handling
//!
//! A delivery is verified against the raw body, sanitized, logged, and then
//! routed to its handler under the retry coordinator. Operators can list the
//! event log and replay failed events, which are re-fetched from Stripe since
//! the log only keeps the sanitized payload.

use std::sync::Arc;

use congregate_shared::ProcessingState;
use serde::Serialize;
use uuid::Uuid;

use crate::audit;
use crate::client::EventSource;
use crate::error::{BillingError, BillingResult};
use crate::event_log::EventLog;
use crate::events::{EventEnvelope, StripeEvent};
use crate::models::{EventLogFilter, EventLogQuery, WebhookEventRecord};
use crate::retry::{RetryCoordinator, RetryOutcome, RetryPolicy, WEBHOOK_SOURCE};
use crate::router::EventRouter;
use crate::sanitize::{sanitize, SanitizedPayload};
use crate::signature::SignatureVerifier;
use crate::store::BillingStore;

/// Default cap for a bulk replay.
pub const DEFAULT_REPLAY_BATCH: i64 = 100;

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    verifier: SignatureVerifier,
    store: Arc<dyn BillingStore>,
    event_log: EventLog,
    coordinator: RetryCoordinator,
    router: EventRouter,
    events: Option<Arc<dyn EventSource>>,
}

/// What happened to one delivery.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub event_id: String,
    pub event_type: String,
    /// `false` when Stripe redelivered an event already in the log.
    pub first_delivery: bool,
    pub outcome: RetryOutcome,
}

impl WebhookHandler {
    pub fn new(
        verifier: SignatureVerifier,
        store: Arc<dyn BillingStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            verifier,
            event_log: EventLog::new(store.clone()),
            coordinator: RetryCoordinator::new(store.clone(), policy),
            router: EventRouter::new(store.clone()),
            store,
            events: None,
        }
    }

    /// Enable replay by giving the handler a way to re-fetch events.
    pub fn with_event_source(mut self, events: Arc<dyn EventSource>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn is_configured(&self) -> bool {
        self.verifier.is_configured()
    }

    /// Verify and parse a Stripe webhook delivery.
    pub fn verify_event(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> BillingResult<EventEnvelope> {
        self.verifier.verify(payload, signature)
    }

    /// Full delivery path: verify, log, process.
    ///
    /// Returns `Err` only when the delivery must be rejected (verification)
    /// or could not be logged. Handler failures are reported in the
    /// [`DeliveryReport`] and left to the retry machinery.
    pub async fn receive(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> BillingResult<DeliveryReport> {
        let envelope = self.verify_event(payload, signature)?;
        self.handle_event(envelope).await
    }

    /// Handle an event whose origin has already been established.
    pub async fn handle_event(&self, envelope: EventEnvelope) -> BillingResult<DeliveryReport> {
        let sanitized = sanitize(&envelope);
        let first_delivery = self.event_log.record_received(&sanitized).await?;
        let event = StripeEvent::from(envelope);

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            livemode = event.livemode,
            first_delivery = first_delivery,
            "Processing Stripe webhook event"
        );

        let outcome = self
            .coordinator
            .process(
                WEBHOOK_SOURCE,
                &event.id,
                &event.event_type,
                &sanitized,
                || self.router.route(&event),
            )
            .await;

        self.finish(&sanitized, &outcome, first_delivery).await;

        Ok(DeliveryReport {
            event_id: event.id,
            event_type: event.event_type,
            first_delivery,
            outcome,
        })
    }

    async fn finish(
        &self,
        sanitized: &SanitizedPayload,
        outcome: &RetryOutcome,
        first_delivery: bool,
    ) {
        if outcome.should_mark_log(first_delivery) {
            self.event_log
                .mark_processed(&sanitized.id, outcome.success, outcome.error.as_deref())
                .await;
        }

        audit::webhook(
            WEBHOOK_SOURCE,
            &sanitized.event_type,
            outcome.success,
            &serde_json::json!({
                "event_id": sanitized.id,
                "object_id": sanitized.object_id,
                "outcome": outcome,
            }),
        );
    }

    // ============ WEBHOOK REPLAY FUNCTIONALITY ============

    /// List failed webhook events that can be replayed
    pub async fn list_failed_webhooks(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.list_webhooks(EventLogFilter::Failed, limit, offset)
            .await
    }

    /// List webhook events, newest first
    pub async fn list_webhooks(
        &self,
        filter: EventLogFilter,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.event_log
            .list(EventLogQuery::new(filter, limit, offset))
            .await
    }

    /// Re-fetch an event from Stripe and process it again.
    ///
    /// The event must already be in the log. Its idempotency record is
    /// force-claimed, so an exhausted event gets a fresh set of attempts, but
    /// an event that already succeeded is not run twice.
    pub async fn replay_webhook(&self, stripe_event_id: &str) -> BillingResult<WebhookReplayResult> {
        self.replay(stripe_event_id, true).await
    }

    async fn replay(&self, stripe_event_id: &str, force: bool) -> BillingResult<WebhookReplayResult> {
        tracing::info!(
            stripe_event_id = %stripe_event_id,
            forced = force,
            "Attempting to replay webhook event"
        );

        let events = self.events.as_ref().ok_or_else(|| {
            BillingError::Misconfigured("STRIPE_SECRET_KEY not set; replay unavailable".to_string())
        })?;

        let existing = self.event_log.get(stripe_event_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!(
                "Webhook event {} not found in database",
                stripe_event_id
            ))
        })?;

        let raw = events.fetch_event(stripe_event_id).await?;
        let envelope = EventEnvelope::from_slice(&raw)?;
        if envelope.id != stripe_event_id {
            return Err(BillingError::MalformedPayload(format!(
                "Stripe returned event {} for {}",
                envelope.id, stripe_event_id
            )));
        }

        let sanitized = sanitize(&envelope);
        let event = StripeEvent::from(envelope);

        let outcome = if force {
            self.coordinator
                .process_forced(
                    WEBHOOK_SOURCE,
                    &event.id,
                    &event.event_type,
                    &sanitized,
                    || self.router.route(&event),
                )
                .await
        } else {
            self.coordinator
                .process(
                    WEBHOOK_SOURCE,
                    &event.id,
                    &event.event_type,
                    &sanitized,
                    || self.router.route(&event),
                )
                .await
        };

        // A replay always reports its result on the log row.
        self.finish(&sanitized, &outcome, true).await;

        let new_status = if outcome.success { "processed" } else { "failed" };
        tracing::info!(
            stripe_event_id = %stripe_event_id,
            previous_status = %existing.status(),
            new_status = %new_status,
            success = outcome.success,
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            record_id: existing.id,
            stripe_event_id: stripe_event_id.to_string(),
            event_type: event.event_type,
            previous_status: existing.status().to_string(),
            previous_error: existing.error_message,
            new_status: new_status.to_string(),
            new_error: outcome.error,
            success: outcome.success,
        })
    }

    /// Scheduled replay of failed webhooks, oldest first.
    ///
    /// Each replay counts against the event's attempt budget. Events that
    /// have used it up are skipped and stay failed until an operator
    /// replays them with [`replay_webhook`](Self::replay_webhook).
    pub async fn replay_all_failed(
        &self,
        max_events: Option<i64>,
    ) -> BillingResult<Vec<WebhookReplayResult>> {
        let batch = max_events.unwrap_or(DEFAULT_REPLAY_BATCH).clamp(1, 500);

        let mut candidates = Vec::new();
        let mut exhausted = 0usize;
        let mut offset = 0;
        'pages: loop {
            let mut query = EventLogQuery::new(EventLogFilter::Failed, batch, offset);
            query.oldest_first = true;
            let page = self.event_log.list(query).await?;
            let page_len = page.len() as i64;

            for record in page {
                if self.is_exhausted(&record.stripe_event_id).await? {
                    exhausted += 1;
                    continue;
                }
                candidates.push(record);
                if candidates.len() as i64 >= batch {
                    break 'pages;
                }
            }

            if page_len < batch {
                break;
            }
            offset += batch;
        }

        if exhausted > 0 {
            tracing::info!(
                exhausted = exhausted,
                "Skipping webhooks with no attempts left; manual replay required"
            );
        }

        let mut results = Vec::with_capacity(candidates.len());

        for record in candidates {
            match self.replay(&record.stripe_event_id, false).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        stripe_event_id = %record.stripe_event_id,
                        error = %e,
                        "Failed to replay webhook"
                    );
                    results.push(WebhookReplayResult {
                        record_id: record.id,
                        stripe_event_id: record.stripe_event_id,
                        event_type: record.event_type,
                        previous_status: "failed".to_string(),
                        previous_error: record.error_message,
                        new_status: "failed".to_string(),
                        new_error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }

        Ok(results)
    }

    async fn is_exhausted(&self, stripe_event_id: &str) -> BillingResult<bool> {
        let max_attempts = self.coordinator.policy().max_attempts;
        Ok(self
            .store
            .get_record(WEBHOOK_SOURCE, stripe_event_id)
            .await?
            .is_some_and(|r| r.state == ProcessingState::Failed && r.attempts >= max_attempts))
    }

    /// Release an event stuck in `processing` so the next delivery or replay
    /// can claim it without waiting out the stale window.
    pub async fn reset_stuck_webhook(&self, stripe_event_id: &str) -> BillingResult<()> {
        if !self.store.release_stuck(WEBHOOK_SOURCE, stripe_event_id).await? {
            return Err(BillingError::NotFound(format!(
                "Webhook {} not found or not in resettable state",
                stripe_event_id
            )));
        }

        tracing::info!(
            stripe_event_id = %stripe_event_id,
            "Webhook reset for replay"
        );

        Ok(())
    }
}

/// Result of a webhook replay operation
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub record_id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub previous_status: String,
    pub previous_error: Option<String>,
    pub new_status: String,
    pub new_error: Option<String>,
    pub success: bool,
}
