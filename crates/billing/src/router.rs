//! Dispatch of verified events to their handlers

use std::sync::Arc;

use crate::checkout;
use crate::error::{BillingError, BillingResult};
use crate::events::{EventKind, StripeEvent};
use crate::invoices;
use crate::store::BillingStore;
use crate::subscriptions;

/// Result of a handler that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Applied,
    /// Nothing to do for this event; the reason is logged.
    Skipped(String),
}

impl HandlerOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped(reason.into())
    }
}

#[derive(Clone)]
pub struct EventRouter {
    store: Arc<dyn BillingStore>,
}

impl EventRouter {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Unrecognized event types succeed without side effects so Stripe
    /// stops redelivering them.
    pub async fn route(&self, event: &StripeEvent) -> BillingResult<HandlerOutcome> {
        let store = self.store.as_ref();
        let outcome = match &event.kind {
            EventKind::CheckoutCompleted(session) => {
                checkout::handle_checkout_completed(store, event.created, session).await?
            }
            EventKind::CheckoutExpired(session) => {
                checkout::handle_checkout_expired(store, session).await?
            }
            EventKind::InvoicePaid(invoice) => {
                invoices::handle_invoice_paid(store, event.created, invoice).await?
            }
            EventKind::InvoicePaymentFailed(invoice) => {
                invoices::handle_invoice_payment_failed(store, event.created, invoice).await?
            }
            EventKind::SubscriptionCreated(subscription) => {
                subscriptions::handle_subscription_created(store, event.created, subscription)
                    .await?
            }
            EventKind::SubscriptionUpdated(subscription) => {
                subscriptions::handle_subscription_updated(store, event.created, subscription)
                    .await?
            }
            EventKind::SubscriptionDeleted(subscription) => {
                subscriptions::handle_subscription_deleted(store, event.created, subscription)
                    .await?
            }
            EventKind::Malformed { reason } => {
                return Err(BillingError::MalformedPayload(format!(
                    "{}: {}",
                    event.event_type, reason
                )));
            }
            EventKind::Unknown => {
                tracing::debug!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Unhandled webhook event type"
                );
                HandlerOutcome::skipped("unhandled event type")
            }
        };

        if let HandlerOutcome::Skipped(reason) = &outcome {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                reason = %reason,
                "Webhook event skipped"
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventEnvelope;
    use crate::store::MemoryBillingStore;
    use serde_json::json;

    fn event(event_type: &str, object: serde_json::Value) -> StripeEvent {
        let body = json!({
            "id": "evt_1",
            "type": event_type,
            "created": 1_700_000_000,
            "data": { "object": object }
        });
        EventEnvelope::from_slice(body.to_string().as_bytes())
            .unwrap()
            .into()
    }

    #[tokio::test]
    async fn unknown_type_is_skipped_without_writes() {
        let store = Arc::new(MemoryBillingStore::new());
        let router = EventRouter::new(store.clone());

        let outcome = router
            .route(&event("customer.created", json!({"id": "cus_1"})))
            .await
            .unwrap();

        assert!(matches!(outcome, HandlerOutcome::Skipped(_)));
        assert_eq!(store.write_count().await, 0);
    }

    #[tokio::test]
    async fn malformed_object_fails() {
        let router = EventRouter::new(Arc::new(MemoryBillingStore::new()));
        let err = router
            .route(&event("invoice.paid", json!({"id": 42})))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::MalformedPayload(_)));
    }

    #[tokio::test]
    async fn checkout_for_other_flows_is_ignored() {
        let store = Arc::new(MemoryBillingStore::new());
        let router = EventRouter::new(store.clone());

        let outcome = router
            .route(&event(
                "checkout.session.completed",
                json!({"id": "cs_1", "metadata": {"checkout_type": "donation"}}),
            ))
            .await
            .unwrap();

        assert!(matches!(outcome, HandlerOutcome::Skipped(_)));
        assert_eq!(store.write_count().await, 0);
    }
}
