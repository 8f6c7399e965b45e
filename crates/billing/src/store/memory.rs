//! In-memory store used by the test suites
//!
//! Mirrors the Postgres semantics (conflict handling, event-time guards) and
//! lets tests inject a failure into any write.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use congregate_shared::{PendingRequestStatus, ProcessingState};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{EventLogStore, IdempotencyStore, SubscriptionStore, TenantStore};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    ClaimRequest, ClaimResult, EventLogFilter, EventLogQuery, IdempotencyRecord, Invoice,
    NewInvoice, NewTenant, OwnerPromotion, PendingRequestUpdate, PendingTenantRequest, Plan,
    Profile, Subscription, SubscriptionStatusChange, SubscriptionUpsert, Tenant,
    WebhookEventRecord,
};
use crate::sanitize::SanitizedPayload;

/// Writes that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    InsertEvent,
    MarkEventProcessed,
    Claim,
    UpdatePendingRequest,
    CreateTenant,
    PromoteOwner,
    DeleteTenant,
    UpsertSubscription,
    UpdateSubscriptionStatus,
    InsertInvoice,
}

#[derive(Default)]
struct MemoryState {
    events: Vec<WebhookEventRecord>,
    idempotency: HashMap<(String, String), IdempotencyRecord>,
    pending: HashMap<Uuid, PendingTenantRequest>,
    tenants: HashMap<Uuid, Tenant>,
    profiles: HashMap<Uuid, Profile>,
    plans: HashMap<Uuid, Plan>,
    subscriptions: HashMap<String, Subscription>,
    invoices: Vec<Invoice>,
    fail_points: HashSet<FailPoint>,
    writes: usize,
}

impl MemoryState {
    /// Count a write attempt and trip its fail point if armed.
    fn write(&mut self, point: FailPoint) -> BillingResult<()> {
        self.writes += 1;
        if self.fail_points.contains(&point) {
            return Err(BillingError::Storage(format!("injected failure: {point:?}")));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBillingStore {
    state: Mutex<MemoryState>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_on(&self, point: FailPoint) {
        self.state.lock().await.fail_points.insert(point);
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.fail_points.clear();
    }

    /// Number of write operations attempted so far.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }

    pub async fn insert_plan(&self, name: &str, stripe_price_id: Option<&str>) -> Plan {
        let plan = Plan {
            id: Uuid::new_v4(),
            name: name.to_string(),
            stripe_price_id: stripe_price_id.map(str::to_string),
            active: true,
        };
        self.state.lock().await.plans.insert(plan.id, plan.clone());
        plan
    }

    pub async fn insert_profile(&self, user_id: Uuid) -> Profile {
        let profile = Profile {
            id: user_id,
            tenant_id: None,
            role: "member".to_string(),
            member_stage: None,
        };
        self.state
            .lock()
            .await
            .profiles
            .insert(user_id, profile.clone());
        profile
    }

    pub async fn insert_tenant(&self, tenant: NewTenant) -> Tenant {
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: tenant.name,
            slug: tenant.slug,
            settings: tenant.settings,
            created_at: OffsetDateTime::now_utc(),
        };
        self.state
            .lock()
            .await
            .tenants
            .insert(tenant.id, tenant.clone());
        tenant
    }

    pub async fn insert_pending_request(
        &self,
        user_id: Uuid,
        tenant_name: &str,
        tenant_slug: &str,
        plan_id: Option<Uuid>,
        status: PendingRequestStatus,
    ) -> PendingTenantRequest {
        let request = PendingTenantRequest {
            id: Uuid::new_v4(),
            user_id,
            tenant_name: tenant_name.to_string(),
            tenant_slug: tenant_slug.to_string(),
            plan_id,
            status,
            stripe_subscription_id: None,
            metadata: serde_json::json!({}),
            completed_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        self.state
            .lock()
            .await
            .pending
            .insert(request.id, request.clone());
        request
    }

    pub async fn seed_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.stripe_subscription_id.clone(), subscription);
    }

    pub async fn pending_request(&self, id: Uuid) -> Option<PendingTenantRequest> {
        self.state.lock().await.pending.get(&id).cloned()
    }

    pub async fn profile(&self, id: Uuid) -> Option<Profile> {
        self.state.lock().await.profiles.get(&id).cloned()
    }

    pub async fn tenants(&self) -> Vec<Tenant> {
        self.state.lock().await.tenants.values().cloned().collect()
    }

    pub async fn subscription(&self, stripe_subscription_id: &str) -> Option<Subscription> {
        self.state
            .lock()
            .await
            .subscriptions
            .get(stripe_subscription_id)
            .cloned()
    }

    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.state
            .lock()
            .await
            .subscriptions
            .values()
            .cloned()
            .collect()
    }

    pub async fn invoices(&self) -> Vec<Invoice> {
        self.state.lock().await.invoices.clone()
    }

    pub async fn events(&self) -> Vec<WebhookEventRecord> {
        self.state.lock().await.events.clone()
    }

    pub async fn idempotency_record(&self, source: &str, key: &str) -> Option<IdempotencyRecord> {
        self.state
            .lock()
            .await
            .idempotency
            .get(&(source.to_string(), key.to_string()))
            .cloned()
    }

    /// Backdate a processing record so it looks abandoned.
    pub async fn age_idempotency_record(&self, source: &str, key: &str, by: time::Duration) {
        if let Some(record) = self
            .state
            .lock()
            .await
            .idempotency
            .get_mut(&(source.to_string(), key.to_string()))
        {
            record.started_at -= by;
        }
    }
}

fn matches_filter(record: &WebhookEventRecord, filter: EventLogFilter) -> bool {
    match filter {
        EventLogFilter::All => true,
        EventLogFilter::Pending => !record.processed && record.processed_at.is_none(),
        EventLogFilter::Failed => !record.processed && record.processed_at.is_some(),
        EventLogFilter::Processed => record.processed,
    }
}

fn merge_metadata(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}

#[async_trait]
impl EventLogStore for MemoryBillingStore {
    async fn insert_event(&self, payload: &SanitizedPayload) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        state.write(FailPoint::InsertEvent)?;

        if state.events.iter().any(|e| e.stripe_event_id == payload.id) {
            return Ok(false);
        }

        state.events.push(WebhookEventRecord {
            id: Uuid::new_v4(),
            stripe_event_id: payload.id.clone(),
            event_type: payload.event_type.clone(),
            livemode: payload.livemode,
            event_created_at: crate::events::from_unix(payload.created),
            payload: payload.to_json(),
            processed: false,
            processed_at: None,
            error_message: None,
            received_at: OffsetDateTime::now_utc(),
        });
        Ok(true)
    }

    async fn mark_event_processed(
        &self,
        stripe_event_id: &str,
        success: bool,
        error: Option<&str>,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        state.write(FailPoint::MarkEventProcessed)?;

        match state
            .events
            .iter_mut()
            .find(|e| e.stripe_event_id == stripe_event_id)
        {
            Some(record) => {
                record.processed = success;
                record.processed_at = Some(OffsetDateTime::now_utc());
                record.error_message = error.map(str::to_string);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_event(&self, stripe_event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .find(|e| e.stripe_event_id == stripe_event_id)
            .cloned())
    }

    async fn list_events(&self, query: EventLogQuery) -> BillingResult<Vec<WebhookEventRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<WebhookEventRecord> = state
            .events
            .iter()
            .filter(|e| matches_filter(e, query.filter))
            .cloned()
            .collect();

        // Insertion order is receive order.
        if !query.oldest_first {
            records.reverse();
        }

        Ok(records
            .into_iter()
            .skip(usize::try_from(query.offset).unwrap_or(0))
            .take(usize::try_from(query.limit).unwrap_or(0))
            .collect())
    }
}

#[async_trait]
impl IdempotencyStore for MemoryBillingStore {
    async fn claim(&self, request: &ClaimRequest<'_>) -> BillingResult<ClaimResult> {
        let mut state = self.state.lock().await;
        state.write(FailPoint::Claim)?;

        let now = OffsetDateTime::now_utc();
        let key = (
            request.source.to_string(),
            request.idempotency_key.to_string(),
        );

        let Some(record) = state.idempotency.get_mut(&key) else {
            let record = IdempotencyRecord {
                id: Uuid::new_v4(),
                source: request.source.to_string(),
                idempotency_key: request.idempotency_key.to_string(),
                event_type: request.event_type.to_string(),
                state: ProcessingState::Processing,
                attempts: 1,
                last_error: None,
                started_at: now,
                completed_at: None,
            };
            state.idempotency.insert(key, record.clone());
            return Ok(ClaimResult::Acquired(record));
        };

        match record.state {
            ProcessingState::Completed => Ok(ClaimResult::AlreadyCompleted),
            ProcessingState::Processing if now - record.started_at < request.stale_after => {
                Ok(ClaimResult::InFlight)
            }
            ProcessingState::Processing => {
                record.attempts += 1;
                record.started_at = now;
                record.last_error = Some(format!("Recovered from stuck state at {now}"));
                Ok(ClaimResult::Acquired(record.clone()))
            }
            ProcessingState::Failed if !request.force && record.attempts >= request.max_attempts => {
                Ok(ClaimResult::RetriesExhausted(record.clone()))
            }
            ProcessingState::Failed => {
                record.attempts = if request.force { 1 } else { record.attempts + 1 };
                record.state = ProcessingState::Processing;
                record.started_at = now;
                Ok(ClaimResult::Acquired(record.clone()))
            }
        }
    }

    async fn get_record(
        &self,
        source: &str,
        key: &str,
    ) -> BillingResult<Option<IdempotencyRecord>> {
        Ok(self.idempotency_record(source, key).await)
    }

    async fn complete(&self, record_id: Uuid) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.writes += 1;
        if let Some(record) = state.idempotency.values_mut().find(|r| r.id == record_id) {
            record.state = ProcessingState::Completed;
            record.completed_at = Some(OffsetDateTime::now_utc());
            record.last_error = None;
        }
        Ok(())
    }

    async fn fail(&self, record_id: Uuid, error: &str) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.writes += 1;
        if let Some(record) = state.idempotency.values_mut().find(|r| r.id == record_id) {
            record.state = ProcessingState::Failed;
            record.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn release_stuck(&self, source: &str, key: &str) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        state.writes += 1;
        match state
            .idempotency
            .get_mut(&(source.to_string(), key.to_string()))
        {
            Some(record) if record.state == ProcessingState::Processing => {
                record.state = ProcessingState::Failed;
                record.last_error = Some("Manually reset by admin".to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl TenantStore for MemoryBillingStore {
    async fn get_pending_request(&self, id: Uuid) -> BillingResult<Option<PendingTenantRequest>> {
        Ok(self.state.lock().await.pending.get(&id).cloned())
    }

    async fn update_pending_request(
        &self,
        id: Uuid,
        update: &PendingRequestUpdate,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.write(FailPoint::UpdatePendingRequest)?;

        let request = state
            .pending
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("pending tenant request {id}")))?;

        if let Some(status) = update.status {
            request.status = status;
        }
        if let Some(subscription_id) = &update.stripe_subscription_id {
            request.stripe_subscription_id = Some(subscription_id.clone());
        }
        if let Some(completed_at) = update.completed_at {
            request.completed_at = Some(completed_at);
        }
        if let Some(patch) = &update.metadata {
            merge_metadata(&mut request.metadata, patch);
        }
        Ok(())
    }

    async fn expire_pending_request(&self, id: Uuid) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        state.write(FailPoint::UpdatePendingRequest)?;

        match state.pending.get_mut(&id) {
            Some(request) if request.status == PendingRequestStatus::PendingPayment => {
                request.status = PendingRequestStatus::Expired;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_tenant(&self, tenant: &NewTenant) -> BillingResult<Tenant> {
        let mut state = self.state.lock().await;
        state.write(FailPoint::CreateTenant)?;

        if state.tenants.values().any(|t| t.slug == tenant.slug) {
            return Err(BillingError::Storage(format!(
                "duplicate key value violates unique constraint \"tenants_slug_key\" ({})",
                tenant.slug
            )));
        }

        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: tenant.name.clone(),
            slug: tenant.slug.clone(),
            settings: tenant.settings.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        state.tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn find_tenant_by_slug(&self, slug: &str) -> BillingResult<Option<Tenant>> {
        let state = self.state.lock().await;
        Ok(state.tenants.values().find(|t| t.slug == slug).cloned())
    }

    async fn delete_tenant(&self, id: Uuid) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        state.write(FailPoint::DeleteTenant)?;

        let removed = state.tenants.remove(&id).is_some();
        if removed {
            for profile in state.profiles.values_mut() {
                if profile.tenant_id == Some(id) {
                    profile.tenant_id = None;
                }
            }
        }
        Ok(removed)
    }

    async fn promote_owner(&self, promotion: &OwnerPromotion) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.write(FailPoint::PromoteOwner)?;

        let profile = state.profiles.get_mut(&promotion.user_id).ok_or_else(|| {
            BillingError::ProfileUpdateFailed(format!("no profile for user {}", promotion.user_id))
        })?;
        profile.tenant_id = Some(promotion.tenant_id);
        profile.role = promotion.role.clone();
        profile.member_stage = Some(promotion.member_stage.clone());
        Ok(())
    }

    async fn find_tenant_for_provisioned_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Uuid>> {
        let state = self.state.lock().await;
        let Some(request) = state.pending.values().find(|r| {
            r.status == PendingRequestStatus::Completed
                && r.stripe_subscription_id.as_deref() == Some(stripe_subscription_id)
        }) else {
            return Ok(None);
        };

        let request_id = request.id.to_string();
        Ok(state
            .tenants
            .values()
            .find(|t| {
                t.settings
                    .get(crate::provisioning::PENDING_REQUEST_ID_KEY)
                    .and_then(|v| v.as_str())
                    == Some(request_id.as_str())
            })
            .map(|t| t.id))
    }
}

#[async_trait]
impl SubscriptionStore for MemoryBillingStore {
    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(self.state.lock().await.plans.get(&id).cloned())
    }

    async fn find_plan_by_price(&self, stripe_price_id: &str) -> BillingResult<Option<Plan>> {
        let state = self.state.lock().await;
        Ok(state
            .plans
            .values()
            .find(|p| p.stripe_price_id.as_deref() == Some(stripe_price_id))
            .cloned())
    }

    async fn find_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .get(stripe_subscription_id)
            .cloned())
    }

    async fn find_tenant_for_customer(
        &self,
        stripe_customer_id: &str,
    ) -> BillingResult<Option<Uuid>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.stripe_customer_id.as_deref() == Some(stripe_customer_id))
            .max_by_key(|s| s.last_event_at)
            .map(|s| s.tenant_id))
    }

    async fn upsert_subscription(&self, upsert: &SubscriptionUpsert) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        state.write(FailPoint::UpsertSubscription)?;

        match state.subscriptions.get_mut(&upsert.stripe_subscription_id) {
            Some(existing) if existing.last_event_at > upsert.event_at => Ok(false),
            Some(existing) => {
                existing.plan_id = upsert.plan_id;
                if upsert.stripe_customer_id.is_some() {
                    existing.stripe_customer_id = upsert.stripe_customer_id.clone();
                }
                existing.status = upsert.status;
                if upsert.current_period_start.is_some() {
                    existing.current_period_start = upsert.current_period_start;
                }
                if upsert.current_period_end.is_some() {
                    existing.current_period_end = upsert.current_period_end;
                }
                existing.cancel_at_period_end = upsert.cancel_at_period_end;
                existing.canceled_at = upsert.canceled_at;
                existing.last_event_at = upsert.event_at;
                Ok(true)
            }
            None => {
                let subscription = Subscription {
                    id: Uuid::new_v4(),
                    tenant_id: upsert.tenant_id,
                    plan_id: upsert.plan_id,
                    stripe_subscription_id: upsert.stripe_subscription_id.clone(),
                    stripe_customer_id: upsert.stripe_customer_id.clone(),
                    status: upsert.status,
                    current_period_start: upsert.current_period_start,
                    current_period_end: upsert.current_period_end,
                    cancel_at_period_end: upsert.cancel_at_period_end,
                    canceled_at: upsert.canceled_at,
                    last_event_at: upsert.event_at,
                };
                state
                    .subscriptions
                    .insert(subscription.stripe_subscription_id.clone(), subscription);
                Ok(true)
            }
        }
    }

    async fn update_subscription_status(
        &self,
        change: &SubscriptionStatusChange,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        state.write(FailPoint::UpdateSubscriptionStatus)?;

        match state.subscriptions.get_mut(&change.stripe_subscription_id) {
            Some(existing) if existing.last_event_at <= change.event_at => {
                existing.status = change.status;
                if let Some(cancel_at_period_end) = change.cancel_at_period_end {
                    existing.cancel_at_period_end = cancel_at_period_end;
                }
                if change.canceled_at.is_some() {
                    existing.canceled_at = change.canceled_at;
                }
                existing.last_event_at = change.event_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_invoice(&self, invoice: &NewInvoice) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        state.write(FailPoint::InsertInvoice)?;

        if state
            .invoices
            .iter()
            .any(|i| i.stripe_invoice_id == invoice.stripe_invoice_id && i.status == invoice.status)
        {
            return Ok(false);
        }

        state.invoices.push(Invoice {
            id: Uuid::new_v4(),
            tenant_id: invoice.tenant_id,
            subscription_id: invoice.subscription_id,
            stripe_invoice_id: invoice.stripe_invoice_id.clone(),
            stripe_payment_intent_id: invoice.stripe_payment_intent_id.clone(),
            amount_cents: invoice.amount_cents,
            currency: invoice.currency.clone(),
            status: invoice.status,
            paid_at: invoice.paid_at,
            payment_method: invoice.payment_method.clone(),
        });
        Ok(true)
    }
}
