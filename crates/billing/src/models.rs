//! Records read and written by the webhook pipeline

use std::str::FromStr;

use congregate_shared::{
    InvoiceStatus, PendingRequestStatus, ProcessingState, SubscriptionStatus, UnknownStatus,
};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

/// Stored webhook event record (sanitized payload only)
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub livemode: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub event_created_at: OffsetDateTime,
    pub payload: serde_json::Value,
    pub processed: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

impl WebhookEventRecord {
    pub fn status(&self) -> &'static str {
        match (self.processed, self.processed_at) {
            (true, _) => "processed",
            (false, Some(_)) => "failed",
            (false, None) => "pending",
        }
    }
}

/// Which event log rows to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventLogFilter {
    #[default]
    All,
    /// Received but not yet marked.
    Pending,
    /// Marked processed=false.
    Failed,
    Processed,
}

impl FromStr for EventLogFilter {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "pending" => Ok(Self::Pending),
            "failed" | "error" => Ok(Self::Failed),
            "processed" | "success" => Ok(Self::Processed),
            other => Err(UnknownStatus {
                kind: "event log",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EventLogQuery {
    pub filter: EventLogFilter,
    pub limit: i64,
    pub offset: i64,
    pub oldest_first: bool,
}

impl EventLogQuery {
    pub fn new(filter: EventLogFilter, limit: i64, offset: i64) -> Self {
        Self {
            filter,
            limit: limit.clamp(1, 500),
            offset: offset.max(0),
            oldest_first: false,
        }
    }
}

/// Idempotency record owned by the retry coordinator
#[derive(Debug, Clone, Serialize)]
pub struct IdempotencyRecord {
    pub id: Uuid,
    pub source: String,
    pub idempotency_key: String,
    pub event_type: String,
    pub state: ProcessingState,
    pub attempts: i32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

/// Parameters for claiming an idempotency record.
#[derive(Debug, Clone)]
pub struct ClaimRequest<'a> {
    pub source: &'a str,
    pub idempotency_key: &'a str,
    pub event_type: &'a str,
    pub payload: &'a serde_json::Value,
    pub max_attempts: i32,
    /// A `processing` record older than this is considered abandoned.
    pub stale_after: time::Duration,
    /// Operator replay: a failed record is re-run with its counter reset.
    pub force: bool,
}

#[derive(Debug, Clone)]
pub enum ClaimResult {
    /// Caller owns this attempt.
    Acquired(IdempotencyRecord),
    AlreadyCompleted,
    /// Another delivery is processing the same key.
    InFlight,
    RetriesExhausted(IdempotencyRecord),
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub settings: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewTenant {
    pub name: String,
    pub slug: String,
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingTenantRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_name: String,
    pub tenant_slug: String,
    pub plan_id: Option<Uuid>,
    pub status: PendingRequestStatus,
    pub stripe_subscription_id: Option<String>,
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Partial update of a pending request. `metadata` is merged into the
/// existing object rather than replacing it.
#[derive(Debug, Clone, Default)]
pub struct PendingRequestUpdate {
    pub status: Option<PendingRequestStatus>,
    pub stripe_subscription_id: Option<String>,
    pub completed_at: Option<OffsetDateTime>,
    pub metadata: Option<serde_json::Value>,
}

impl PendingRequestUpdate {
    pub fn status(status: PendingRequestStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Owner promotion applied to the requesting user's profile.
#[derive(Debug, Clone)]
pub struct OwnerPromotion {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub role: String,
    pub member_stage: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub role: String,
    pub member_stage: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub stripe_price_id: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: Option<String>,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_event_at: OffsetDateTime,
}

/// Insert-or-update keyed by `stripe_subscription_id`.
///
/// Applied only when `event_at` is not older than the stored row's
/// `last_event_at`. An existing row keeps its tenant. Absent customer and
/// period values keep the stored ones.
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert {
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub event_at: OffsetDateTime,
}

/// Status-only transition, guarded by `last_event_at` like the upsert.
#[derive(Debug, Clone)]
pub struct SubscriptionStatusChange {
    pub stripe_subscription_id: String,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: Option<bool>,
    pub canceled_at: Option<OffsetDateTime>,
    pub event_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub stripe_invoice_id: String,
    pub stripe_payment_intent_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub paid_at: Option<OffsetDateTime>,
    pub payment_method: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Invoice {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub stripe_invoice_id: String,
    pub stripe_payment_intent_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    pub payment_method: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_log_filter_accepts_legacy_names() {
        assert_eq!("error".parse::<EventLogFilter>().unwrap(), EventLogFilter::Failed);
        assert_eq!(
            "success".parse::<EventLogFilter>().unwrap(),
            EventLogFilter::Processed
        );
        assert!("stuck".parse::<EventLogFilter>().is_err());
    }

    #[test]
    fn event_log_query_clamps_paging() {
        let query = EventLogQuery::new(EventLogFilter::All, 10_000, -5);
        assert_eq!(query.limit, 500);
        assert_eq!(query.offset, 0);
    }
}
