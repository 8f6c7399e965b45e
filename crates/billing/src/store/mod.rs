//! Storage seams for the webhook pipeline
//!
//! Every table the pipeline touches is reached through one of these traits.
//! [`PgBillingStore`] is the production implementation; [`MemoryBillingStore`]
//! backs the tests and supports injected failures.

mod memory;
mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    ClaimRequest, ClaimResult, EventLogQuery, IdempotencyRecord, NewInvoice, NewTenant,
    OwnerPromotion, PendingRequestUpdate, PendingTenantRequest, Plan, Subscription,
    SubscriptionStatusChange, SubscriptionUpsert, Tenant, WebhookEventRecord,
};
use crate::sanitize::SanitizedPayload;

pub use memory::{FailPoint, MemoryBillingStore};
pub use postgres::PgBillingStore;

#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Insert a received event. Returns `false` when the event id is already
    /// logged (redelivery).
    async fn insert_event(&self, payload: &SanitizedPayload) -> BillingResult<bool>;

    /// Returns `false` when no row exists for the event id.
    async fn mark_event_processed(
        &self,
        stripe_event_id: &str,
        success: bool,
        error: Option<&str>,
    ) -> BillingResult<bool>;

    async fn get_event(&self, stripe_event_id: &str) -> BillingResult<Option<WebhookEventRecord>>;

    async fn list_events(&self, query: EventLogQuery) -> BillingResult<Vec<WebhookEventRecord>>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claim `(source, key)` for one processing attempt.
    async fn claim(&self, request: &ClaimRequest<'_>) -> BillingResult<ClaimResult>;

    async fn get_record(&self, source: &str, key: &str)
        -> BillingResult<Option<IdempotencyRecord>>;

    async fn complete(&self, record_id: Uuid) -> BillingResult<()>;

    async fn fail(&self, record_id: Uuid, error: &str) -> BillingResult<()>;

    /// Move a `processing` record to `failed` so it can be retried.
    /// Returns `false` when no processing record exists.
    async fn release_stuck(&self, source: &str, key: &str) -> BillingResult<bool>;
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get_pending_request(&self, id: Uuid) -> BillingResult<Option<PendingTenantRequest>>;

    async fn update_pending_request(
        &self,
        id: Uuid,
        update: &PendingRequestUpdate,
    ) -> BillingResult<()>;

    /// `pending_payment -> expired`. Returns `false` for any other status.
    async fn expire_pending_request(&self, id: Uuid) -> BillingResult<bool>;

    async fn create_tenant(&self, tenant: &NewTenant) -> BillingResult<Tenant>;

    async fn find_tenant_by_slug(&self, slug: &str) -> BillingResult<Option<Tenant>>;

    async fn delete_tenant(&self, id: Uuid) -> BillingResult<bool>;

    /// Attach the user's profile to the tenant with owner role and stage.
    async fn promote_owner(&self, promotion: &OwnerPromotion) -> BillingResult<()>;

    /// Tenant provisioned by the completed request that recorded this
    /// Stripe subscription.
    async fn find_tenant_for_provisioned_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Uuid>>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>>;

    async fn find_plan_by_price(&self, stripe_price_id: &str) -> BillingResult<Option<Plan>>;

    async fn find_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    /// Tenant of the most recently updated subscription for a customer.
    async fn find_tenant_for_customer(&self, stripe_customer_id: &str)
        -> BillingResult<Option<Uuid>>;

    /// Returns `false` when the stored row is newer than the upsert.
    async fn upsert_subscription(&self, upsert: &SubscriptionUpsert) -> BillingResult<bool>;

    /// Returns `false` when the row is missing or newer than the change.
    async fn update_subscription_status(
        &self,
        change: &SubscriptionStatusChange,
    ) -> BillingResult<bool>;

    /// Returns `false` when `(stripe_invoice_id, status)` is already recorded.
    async fn insert_invoice(&self, invoice: &NewInvoice) -> BillingResult<bool>;
}

/// Everything the webhook pipeline needs from storage.
pub trait BillingStore: EventLogStore + IdempotencyStore + TenantStore + SubscriptionStore {}

impl<T> BillingStore for T where T: EventLogStore + IdempotencyStore + TenantStore + SubscriptionStore
{}
