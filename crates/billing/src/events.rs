//! Typed Stripe events
//!
//! Deliveries are parsed in two stages. [`EventEnvelope`] keeps the Stripe
//! object untyped so the sanitizer can read it; [`StripeEvent`] then narrows
//! the object into the one shape each handler needs. Unknown event types land
//! in [`EventKind::Unknown`].

use std::collections::HashMap;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const CHECKOUT_SESSION_EXPIRED: &str = "checkout.session.expired";
pub const INVOICE_PAID: &str = "invoice.paid";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";
pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

/// Stripe event as delivered, before the object is typed.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    #[serde(default)]
    pub livemode: bool,
    #[serde(default)]
    pub api_version: Option<String>,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl EventEnvelope {
    /// Parse a raw event body. Only called on bytes whose origin has been
    /// established (signature verified, or fetched from the Stripe API).
    pub fn from_slice(bytes: &[u8]) -> BillingResult<Self> {
        let envelope: EventEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

        if envelope.id.is_empty() {
            return Err(BillingError::MalformedPayload("empty event id".to_string()));
        }
        if !envelope.data.object.is_object() {
            return Err(BillingError::MalformedPayload(
                "data.object is not an object".to_string(),
            ));
        }

        Ok(envelope)
    }

    pub fn created_at(&self) -> OffsetDateTime {
        from_unix(self.created)
    }
}

/// A verified event narrowed to what its handler consumes.
#[derive(Debug, Clone)]
pub struct StripeEvent {
    pub id: String,
    pub event_type: String,
    pub created: OffsetDateTime,
    pub livemode: bool,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    CheckoutCompleted(CheckoutSession),
    CheckoutExpired(CheckoutSession),
    InvoicePaid(InvoiceObject),
    InvoicePaymentFailed(InvoiceObject),
    SubscriptionCreated(SubscriptionObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    /// A handled type whose object did not decode; fails in the router.
    Malformed { reason: String },
    Unknown,
}

impl From<EventEnvelope> for StripeEvent {
    fn from(envelope: EventEnvelope) -> Self {
        let created = envelope.created_at();
        let object = envelope.data.object;

        let kind = match envelope.event_type.as_str() {
            CHECKOUT_SESSION_COMPLETED => decode(object, EventKind::CheckoutCompleted),
            CHECKOUT_SESSION_EXPIRED => decode(object, EventKind::CheckoutExpired),
            INVOICE_PAID => decode(object, EventKind::InvoicePaid),
            INVOICE_PAYMENT_FAILED => decode(object, EventKind::InvoicePaymentFailed),
            SUBSCRIPTION_CREATED => decode(object, EventKind::SubscriptionCreated),
            SUBSCRIPTION_UPDATED => decode(object, EventKind::SubscriptionUpdated),
            SUBSCRIPTION_DELETED => decode(object, EventKind::SubscriptionDeleted),
            _ => EventKind::Unknown,
        };

        Self {
            id: envelope.id,
            event_type: envelope.event_type,
            created,
            livemode: envelope.livemode,
            kind,
        }
    }
}

fn decode<T, F>(object: serde_json::Value, wrap: F) -> EventKind
where
    T: serde::de::DeserializeOwned,
    F: FnOnce(T) -> EventKind,
{
    match serde_json::from_value::<T>(object) {
        Ok(value) => wrap(value),
        Err(e) => EventKind::Malformed {
            reason: e.to_string(),
        },
    }
}

/// Checkout session fields used by the saga and the expiry handler.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default, deserialize_with = "expandable::option_id")]
    pub subscription: Option<String>,
    #[serde(default, deserialize_with = "expandable::option_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
}

impl CheckoutSession {
    /// Metadata value, treating empty strings as absent.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Invoice fields used by the invoice handlers.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable::option_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
    #[serde(default, deserialize_with = "expandable::option_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "expandable::option_id")]
    pub payment_intent: Option<String>,
    #[serde(default, deserialize_with = "expandable::option_id")]
    pub default_payment_method: Option<String>,
    #[serde(default)]
    pub collection_method: Option<String>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub status_transitions: Option<StatusTransitions>,
}

/// Newer API versions move the subscription reference under `parent`.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default, deserialize_with = "expandable::option_id")]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusTransitions {
    #[serde(default)]
    pub paid_at: Option<i64>,
}

impl InvoiceObject {
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_deref().or_else(|| {
            self.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .and_then(|d| d.subscription.as_deref())
        })
    }

    pub fn paid_at(&self) -> Option<OffsetDateTime> {
        self.status_transitions
            .as_ref()
            .and_then(|t| t.paid_at)
            .map(from_unix)
    }

    pub fn currency(&self) -> &str {
        self.currency.as_deref().unwrap_or("usd")
    }

    pub fn payment_method(&self) -> Option<&str> {
        self.default_payment_method
            .as_deref()
            .or(self.collection_method.as_deref())
    }
}

/// Subscription fields used by the subscription handlers.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable::option_id")]
    pub customer: Option<String>,
    pub status: String,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub items: SubscriptionItems,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Price {
    pub id: String,
}

impl SubscriptionObject {
    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }

    /// Billing period, falling back to the first item on API versions that
    /// only report periods per item.
    pub fn period(&self) -> (Option<OffsetDateTime>, Option<OffsetDateTime>) {
        let item = self.items.data.first();
        let start = self
            .current_period_start
            .or_else(|| item.and_then(|i| i.current_period_start));
        let end = self
            .current_period_end
            .or_else(|| item.and_then(|i| i.current_period_end));
        (start.map(from_unix), end.map(from_unix))
    }

    pub fn canceled_at(&self) -> Option<OffsetDateTime> {
        self.canceled_at.map(from_unix)
    }
}

pub(crate) fn from_unix(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(secs).unwrap_or(OffsetDateTime::now_utc())
}

/// Stripe fields that are either an id or an expanded object carrying one.
mod expandable {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdOrObject {
        Id(String),
        Object { id: String },
    }

    pub fn option_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(
            Option::<IdOrObject>::deserialize(deserializer)?.map(|value| match value {
                IdOrObject::Id(id) => id,
                IdOrObject::Object { id } => id,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event_type: &str, object: serde_json::Value) -> EventEnvelope {
        let body = json!({
            "id": "evt_1",
            "type": event_type,
            "created": 1_700_000_000,
            "livemode": false,
            "api_version": "2024-06-20",
            "data": { "object": object }
        });
        EventEnvelope::from_slice(body.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn unknown_types_fall_through() {
        let event: StripeEvent = envelope("charge.refunded", json!({"id": "ch_1"})).into();
        assert!(matches!(event.kind, EventKind::Unknown));
        assert_eq!(event.event_type, "charge.refunded");
    }

    #[test]
    fn checkout_accepts_expanded_customer() {
        let event: StripeEvent = envelope(
            CHECKOUT_SESSION_COMPLETED,
            json!({
                "id": "cs_1",
                "subscription": "sub_1",
                "customer": { "id": "cus_1", "email": "pastor@example.org" },
                "metadata": { "checkout_type": "new_tenant", "tenant_slug": "  " }
            }),
        )
        .into();

        let EventKind::CheckoutCompleted(session) = event.kind else {
            panic!("expected checkout session");
        };
        assert_eq!(session.customer.as_deref(), Some("cus_1"));
        assert_eq!(session.subscription.as_deref(), Some("sub_1"));
        assert_eq!(session.metadata_value("checkout_type"), Some("new_tenant"));
        assert_eq!(session.metadata_value("tenant_slug"), None);
    }

    #[test]
    fn invoice_subscription_from_parent_details() {
        let event: StripeEvent = envelope(
            INVOICE_PAID,
            json!({
                "id": "in_1",
                "parent": { "subscription_details": { "subscription": "sub_9" } },
                "amount_paid": 4900
            }),
        )
        .into();

        let EventKind::InvoicePaid(invoice) = event.kind else {
            panic!("expected invoice");
        };
        assert_eq!(invoice.subscription_id(), Some("sub_9"));
        assert_eq!(invoice.currency(), "usd");
    }

    #[test]
    fn subscription_period_falls_back_to_items() {
        let event: StripeEvent = envelope(
            SUBSCRIPTION_UPDATED,
            json!({
                "id": "sub_1",
                "status": "active",
                "items": { "data": [{
                    "price": { "id": "price_basic" },
                    "current_period_start": 1_700_000_000,
                    "current_period_end": 1_702_592_000
                }]}
            }),
        )
        .into();

        let EventKind::SubscriptionUpdated(sub) = event.kind else {
            panic!("expected subscription");
        };
        let (start, end) = sub.period();
        assert_eq!(start.map(|t| t.unix_timestamp()), Some(1_700_000_000));
        assert_eq!(end.map(|t| t.unix_timestamp()), Some(1_702_592_000));
        assert_eq!(sub.price_id(), Some("price_basic"));
    }

    #[test]
    fn known_type_with_wrong_shape_is_malformed() {
        let event: StripeEvent =
            envelope(SUBSCRIPTION_CREATED, json!({"id": "sub_1", "status": 7})).into();
        assert!(matches!(event.kind, EventKind::Malformed { .. }));
    }

    #[test]
    fn envelope_rejects_non_object_data() {
        let body = json!({
            "id": "evt_1", "type": "invoice.paid", "created": 1, "data": { "object": "nope" }
        });
        let err = EventEnvelope::from_slice(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, BillingError::MalformedPayload(_)));
    }
}
