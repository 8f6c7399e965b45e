//! Postgres implementation of the billing store

use async_trait::async_trait;
use congregate_shared::ProcessingState;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{EventLogStore, IdempotencyStore, SubscriptionStore, TenantStore};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    ClaimRequest, ClaimResult, EventLogFilter, EventLogQuery, IdempotencyRecord, NewInvoice,
    NewTenant, OwnerPromotion, PendingRequestUpdate, PendingTenantRequest, Plan, Subscription,
    SubscriptionStatusChange, SubscriptionUpsert, Tenant, WebhookEventRecord,
};
use crate::sanitize::SanitizedPayload;

const EVENT_COLUMNS: &str = "id, stripe_event_id, event_type, livemode, event_created_at, \
     payload, processed, processed_at, error_message, received_at";

const IDEMPOTENCY_COLUMNS: &str = "id, source, idempotency_key, event_type, state, attempts, \
     last_error, started_at, completed_at";

const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, plan_id, stripe_subscription_id, \
     stripe_customer_id, status, current_period_start, current_period_end, \
     cancel_at_period_end, canceled_at, last_event_at";

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct IdempotencyRow {
    id: Uuid,
    source: String,
    idempotency_key: String,
    event_type: String,
    state: String,
    attempts: i32,
    last_error: Option<String>,
    started_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
}

impl TryFrom<IdempotencyRow> for IdempotencyRecord {
    type Error = BillingError;

    fn try_from(row: IdempotencyRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            source: row.source,
            idempotency_key: row.idempotency_key,
            event_type: row.event_type,
            state: row.state.parse()?,
            attempts: row.attempts,
            last_error: row.last_error,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PendingRequestRow {
    id: Uuid,
    user_id: Uuid,
    tenant_name: String,
    tenant_slug: String,
    plan_id: Option<Uuid>,
    status: String,
    stripe_subscription_id: Option<String>,
    metadata: serde_json::Value,
    completed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<PendingRequestRow> for PendingTenantRequest {
    type Error = BillingError;

    fn try_from(row: PendingRequestRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            tenant_name: row.tenant_name,
            tenant_slug: row.tenant_slug,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            stripe_subscription_id: row.stripe_subscription_id,
            metadata: row.metadata,
            completed_at: row.completed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    tenant_id: Uuid,
    plan_id: Uuid,
    stripe_subscription_id: String,
    stripe_customer_id: Option<String>,
    status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    canceled_at: Option<OffsetDateTime>,
    last_event_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            plan_id: row.plan_id,
            stripe_subscription_id: row.stripe_subscription_id,
            stripe_customer_id: row.stripe_customer_id,
            status: row.status.parse()?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            canceled_at: row.canceled_at,
            last_event_at: row.last_event_at,
        })
    }
}

fn filter_clause(filter: EventLogFilter) -> &'static str {
    match filter {
        EventLogFilter::All => "TRUE",
        EventLogFilter::Pending => "processed = FALSE AND processed_at IS NULL",
        EventLogFilter::Failed => "processed = FALSE AND processed_at IS NOT NULL",
        EventLogFilter::Processed => "processed = TRUE",
    }
}

#[async_trait]
impl EventLogStore for PgBillingStore {
    async fn insert_event(&self, payload: &SanitizedPayload) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, livemode, event_created_at, payload)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stripe_event_id) DO NOTHING
            "#,
        )
        .bind(&payload.id)
        .bind(&payload.event_type)
        .bind(payload.livemode)
        .bind(crate::events::from_unix(payload.created))
        .bind(payload.to_json())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_event_processed(
        &self,
        stripe_event_id: &str,
        success: bool,
        error: Option<&str>,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processed = $2, processed_at = NOW(), error_message = $3
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(stripe_event_id)
        .bind(success)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_event(&self, stripe_event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM stripe_webhook_events WHERE stripe_event_id = $1"
        );
        let record = sqlx::query_as::<_, WebhookEventRecord>(&sql)
            .bind(stripe_event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn list_events(&self, query: EventLogQuery) -> BillingResult<Vec<WebhookEventRecord>> {
        let order = if query.oldest_first { "ASC" } else { "DESC" };
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM stripe_webhook_events WHERE {} \
             ORDER BY received_at {order} LIMIT $1 OFFSET $2",
            filter_clause(query.filter)
        );
        let records = sqlx::query_as::<_, WebhookEventRecord>(&sql)
            .bind(query.limit)
            .bind(query.offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }
}

#[async_trait]
impl IdempotencyStore for PgBillingStore {
    /// INSERT...ON CONFLICT...RETURNING gives one caller exclusive rights to
    /// an attempt. A conflicting row is only re-claimed when it failed with
    /// attempts left (or the claim is forced), or when it has been stuck in
    /// `processing` past the stale window.
    async fn claim(&self, request: &ClaimRequest<'_>) -> BillingResult<ClaimResult> {
        let sql = format!(
            r#"
            INSERT INTO webhook_idempotency
                (source, idempotency_key, event_type, payload, state, attempts, started_at)
            VALUES ($1, $2, $3, $4, 'processing', 1, NOW())
            ON CONFLICT (source, idempotency_key) DO UPDATE SET
                state = 'processing',
                attempts = CASE
                    WHEN webhook_idempotency.state = 'failed' AND $7 THEN 1
                    ELSE webhook_idempotency.attempts + 1
                END,
                started_at = NOW(),
                last_error = CASE
                    WHEN webhook_idempotency.state = 'processing'
                        THEN CONCAT('Recovered from stuck state at ', NOW()::TEXT)
                    ELSE webhook_idempotency.last_error
                END,
                updated_at = NOW()
            WHERE (webhook_idempotency.state = 'failed'
                    AND ($7 OR webhook_idempotency.attempts < $5))
               OR (webhook_idempotency.state = 'processing'
                    AND webhook_idempotency.started_at < NOW() - make_interval(secs => $6))
            RETURNING {IDEMPOTENCY_COLUMNS}
            "#
        );

        let claimed = sqlx::query_as::<_, IdempotencyRow>(&sql)
            .bind(request.source)
            .bind(request.idempotency_key)
            .bind(request.event_type)
            .bind(request.payload)
            .bind(request.max_attempts)
            .bind(request.stale_after.as_seconds_f64())
            .bind(request.force)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!(
                    source = %request.source,
                    key = %request.idempotency_key,
                    error = %e,
                    "Failed to claim idempotency record"
                );
                BillingError::from(e)
            })?;

        if let Some(row) = claimed {
            return Ok(ClaimResult::Acquired(row.try_into()?));
        }

        let sql = format!(
            "SELECT {IDEMPOTENCY_COLUMNS} FROM webhook_idempotency \
             WHERE source = $1 AND idempotency_key = $2"
        );
        let existing = sqlx::query_as::<_, IdempotencyRow>(&sql)
            .bind(request.source)
            .bind(request.idempotency_key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = existing else {
            // Row vanished between the two statements
            return Ok(ClaimResult::InFlight);
        };
        let record = IdempotencyRecord::try_from(row)?;

        Ok(match record.state {
            ProcessingState::Completed => ClaimResult::AlreadyCompleted,
            ProcessingState::Processing => ClaimResult::InFlight,
            ProcessingState::Failed => ClaimResult::RetriesExhausted(record),
        })
    }

    async fn get_record(
        &self,
        source: &str,
        key: &str,
    ) -> BillingResult<Option<IdempotencyRecord>> {
        let sql = format!(
            "SELECT {IDEMPOTENCY_COLUMNS} FROM webhook_idempotency \
             WHERE source = $1 AND idempotency_key = $2"
        );
        let row = sqlx::query_as::<_, IdempotencyRow>(&sql)
            .bind(source)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(IdempotencyRecord::try_from).transpose()
    }

    async fn complete(&self, record_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_idempotency
            SET state = 'completed', completed_at = NOW(), last_error = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(record_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, record_id: Uuid, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_idempotency
            SET state = 'failed', last_error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(record_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_stuck(&self, source: &str, key: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_idempotency
            SET state = 'failed',
                last_error = 'Manually reset by admin',
                updated_at = NOW()
            WHERE source = $1 AND idempotency_key = $2 AND state = 'processing'
            "#,
        )
        .bind(source)
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TenantStore for PgBillingStore {
    async fn get_pending_request(&self, id: Uuid) -> BillingResult<Option<PendingTenantRequest>> {
        let row: Option<PendingRequestRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, tenant_name, tenant_slug, plan_id, status,
                   stripe_subscription_id, metadata, completed_at, created_at
            FROM pending_tenant_requests
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PendingTenantRequest::try_from).transpose()
    }

    async fn update_pending_request(
        &self,
        id: Uuid,
        update: &PendingRequestUpdate,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pending_tenant_requests
            SET status = COALESCE($2, status),
                stripe_subscription_id = COALESCE($3, stripe_subscription_id),
                completed_at = COALESCE($4, completed_at),
                metadata = metadata || COALESCE($5, '{}'::jsonb),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.stripe_subscription_id.as_deref())
        .bind(update.completed_at)
        .bind(update.metadata.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("pending tenant request {id}")));
        }
        Ok(())
    }

    async fn expire_pending_request(&self, id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_tenant_requests
            SET status = 'expired', updated_at = NOW()
            WHERE id = $1 AND status = 'pending_payment'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_tenant(&self, tenant: &NewTenant) -> BillingResult<Tenant> {
        let created: Tenant = sqlx::query_as(
            r#"
            INSERT INTO tenants (name, slug, settings)
            VALUES ($1, $2, $3)
            RETURNING id, name, slug, settings, created_at
            "#,
        )
        .bind(&tenant.name)
        .bind(&tenant.slug)
        .bind(&tenant.settings)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn find_tenant_by_slug(&self, slug: &str) -> BillingResult<Option<Tenant>> {
        let tenant: Option<Tenant> = sqlx::query_as(
            "SELECT id, name, slug, settings, created_at FROM tenants WHERE slug = $1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tenant)
    }

    async fn delete_tenant(&self, id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query("DELETE FROM tenants WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn promote_owner(&self, promotion: &OwnerPromotion) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE profiles
            SET tenant_id = $2, role = $3, member_stage = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(promotion.user_id)
        .bind(promotion.tenant_id)
        .bind(&promotion.role)
        .bind(&promotion.member_stage)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::ProfileUpdateFailed(format!(
                "no profile for user {}",
                promotion.user_id
            )));
        }
        Ok(())
    }

    async fn find_tenant_for_provisioned_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Uuid>> {
        let tenant_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT t.id
            FROM pending_tenant_requests r
            JOIN tenants t ON t.settings->>'pending_request_id' = r.id::text
            WHERE r.stripe_subscription_id = $1 AND r.status = 'completed'
            ORDER BY r.completed_at DESC NULLS LAST
            LIMIT 1
            "#,
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tenant_id)
    }
}

#[async_trait]
impl SubscriptionStore for PgBillingStore {
    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>> {
        let plan: Option<Plan> = sqlx::query_as(
            "SELECT id, name, stripe_price_id, active FROM subscription_plans WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    async fn find_plan_by_price(&self, stripe_price_id: &str) -> BillingResult<Option<Plan>> {
        let plan: Option<Plan> = sqlx::query_as(
            r#"
            SELECT id, name, stripe_price_id, active
            FROM subscription_plans
            WHERE stripe_price_id = $1
            "#,
        )
        .bind(stripe_price_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    async fn find_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM tenant_subscriptions \
             WHERE stripe_subscription_id = $1"
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(stripe_subscription_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn find_tenant_for_customer(
        &self,
        stripe_customer_id: &str,
    ) -> BillingResult<Option<Uuid>> {
        let tenant: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT tenant_id FROM tenant_subscriptions
            WHERE stripe_customer_id = $1
            ORDER BY last_event_at DESC
            LIMIT 1
            "#,
        )
        .bind(stripe_customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tenant.map(|(id,)| id))
    }

    async fn upsert_subscription(&self, upsert: &SubscriptionUpsert) -> BillingResult<bool> {
        let applied: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO tenant_subscriptions (
                tenant_id, plan_id, stripe_subscription_id, stripe_customer_id, status,
                current_period_start, current_period_end, cancel_at_period_end,
                canceled_at, last_event_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id,
                                              tenant_subscriptions.stripe_customer_id),
                status = EXCLUDED.status,
                current_period_start = COALESCE(EXCLUDED.current_period_start,
                                                tenant_subscriptions.current_period_start),
                current_period_end = COALESCE(EXCLUDED.current_period_end,
                                              tenant_subscriptions.current_period_end),
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                last_event_at = EXCLUDED.last_event_at,
                updated_at = NOW()
            WHERE tenant_subscriptions.last_event_at <= EXCLUDED.last_event_at
            RETURNING id
            "#,
        )
        .bind(upsert.tenant_id)
        .bind(upsert.plan_id)
        .bind(&upsert.stripe_subscription_id)
        .bind(upsert.stripe_customer_id.as_deref())
        .bind(upsert.status.as_str())
        .bind(upsert.current_period_start)
        .bind(upsert.current_period_end)
        .bind(upsert.cancel_at_period_end)
        .bind(upsert.canceled_at)
        .bind(upsert.event_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(applied.is_some())
    }

    async fn update_subscription_status(
        &self,
        change: &SubscriptionStatusChange,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_subscriptions
            SET status = $2,
                cancel_at_period_end = COALESCE($3, cancel_at_period_end),
                canceled_at = COALESCE($4, canceled_at),
                last_event_at = $5,
                updated_at = NOW()
            WHERE stripe_subscription_id = $1 AND last_event_at <= $5
            "#,
        )
        .bind(&change.stripe_subscription_id)
        .bind(change.status.as_str())
        .bind(change.cancel_at_period_end)
        .bind(change.canceled_at)
        .bind(change.event_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_invoice(&self, invoice: &NewInvoice) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO tenant_invoices (
                tenant_id, subscription_id, stripe_invoice_id, stripe_payment_intent_id,
                amount_cents, currency, status, paid_at, payment_method
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (stripe_invoice_id, status) DO NOTHING
            "#,
        )
        .bind(invoice.tenant_id)
        .bind(invoice.subscription_id)
        .bind(&invoice.stripe_invoice_id)
        .bind(invoice.stripe_payment_intent_id.as_deref())
        .bind(invoice.amount_cents)
        .bind(&invoice.currency)
        .bind(invoice.status.as_str())
        .bind(invoice.paid_at)
        .bind(invoice.payment_method.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
