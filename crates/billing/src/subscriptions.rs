//! Subscription lifecycle sync
//!
//! Mirrors `customer.subscription.*` events into `tenant_subscriptions`.
//! Writes carry the Stripe event time and the store ignores any write older
//! than the row's `last_event_at`, so out-of-order deliveries cannot roll a
//! subscription back.

use congregate_shared::SubscriptionStatus;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::SubscriptionObject;
use crate::models::{SubscriptionStatusChange, SubscriptionUpsert};
use crate::router::HandlerOutcome;
use crate::store::BillingStore;

/// Subscription metadata key naming the owning tenant.
pub const TENANT_ID_KEY: &str = "tenant_id";

pub async fn handle_subscription_created(
    store: &dyn BillingStore,
    event_at: OffsetDateTime,
    subscription: &SubscriptionObject,
) -> BillingResult<HandlerOutcome> {
    sync_subscription(store, event_at, subscription, true).await
}

/// Like creation, except an unknown price keeps the stored plan.
pub async fn handle_subscription_updated(
    store: &dyn BillingStore,
    event_at: OffsetDateTime,
    subscription: &SubscriptionObject,
) -> BillingResult<HandlerOutcome> {
    sync_subscription(store, event_at, subscription, false).await
}

pub async fn handle_subscription_deleted(
    store: &dyn BillingStore,
    event_at: OffsetDateTime,
    subscription: &SubscriptionObject,
) -> BillingResult<HandlerOutcome> {
    if store.find_subscription(&subscription.id).await?.is_none() {
        return Ok(HandlerOutcome::skipped("subscription not tracked"));
    }

    let applied = store
        .update_subscription_status(&SubscriptionStatusChange {
            stripe_subscription_id: subscription.id.clone(),
            status: SubscriptionStatus::Canceled,
            cancel_at_period_end: Some(false),
            canceled_at: Some(subscription.canceled_at().unwrap_or(event_at)),
            event_at,
        })
        .await?;

    if !applied {
        return Ok(HandlerOutcome::skipped("stale subscription event"));
    }

    tracing::info!(
        subscription_id = %subscription.id,
        "Subscription canceled"
    );
    Ok(HandlerOutcome::Applied)
}

async fn sync_subscription(
    store: &dyn BillingStore,
    event_at: OffsetDateTime,
    subscription: &SubscriptionObject,
    plan_required: bool,
) -> BillingResult<HandlerOutcome> {
    let status: SubscriptionStatus = subscription.status.parse()?;
    let existing = store.find_subscription(&subscription.id).await?;

    let plan_id = match subscription.price_id() {
        Some(price_id) => store.find_plan_by_price(price_id).await?.map(|plan| plan.id),
        None => None,
    };
    let plan_id = match (plan_id, &existing) {
        (Some(plan_id), _) => plan_id,
        (None, Some(row)) if !plan_required => {
            tracing::warn!(
                subscription_id = %subscription.id,
                price_id = ?subscription.price_id(),
                "Unknown price on subscription update; keeping current plan"
            );
            row.plan_id
        }
        (None, _) => {
            tracing::error!(
                subscription_id = %subscription.id,
                price_id = ?subscription.price_id(),
                "No subscription plan configured for Stripe price"
            );
            return Err(BillingError::PlanNotFound(
                subscription.price_id().unwrap_or("<none>").to_string(),
            ));
        }
    };

    let tenant_id = match &existing {
        Some(row) => Some(row.tenant_id),
        None => resolve_tenant(store, subscription).await?,
    };
    let Some(tenant_id) = tenant_id else {
        // The provisioning saga links new-tenant subscriptions itself.
        return Ok(HandlerOutcome::skipped("subscription not linked to a tenant"));
    };

    let (period_start, period_end) = subscription.period();
    let applied = store
        .upsert_subscription(&SubscriptionUpsert {
            tenant_id,
            plan_id,
            stripe_subscription_id: subscription.id.clone(),
            stripe_customer_id: subscription.customer.clone(),
            status,
            current_period_start: period_start,
            current_period_end: period_end,
            cancel_at_period_end: subscription.cancel_at_period_end,
            canceled_at: subscription.canceled_at(),
            event_at,
        })
        .await?;

    if !applied {
        return Ok(HandlerOutcome::skipped("stale subscription event"));
    }

    tracing::info!(
        subscription_id = %subscription.id,
        tenant_id = %tenant_id,
        status = %status,
        created = existing.is_none(),
        "Subscription synced"
    );
    Ok(HandlerOutcome::Applied)
}

/// Metadata tenant id first, then another subscription of the same customer,
/// then the tenant provisioned for this subscription at checkout.
async fn resolve_tenant(
    store: &dyn BillingStore,
    subscription: &SubscriptionObject,
) -> BillingResult<Option<Uuid>> {
    if let Some(raw) = subscription
        .metadata
        .get(TENANT_ID_KEY)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
    {
        let tenant_id = Uuid::parse_str(raw).map_err(|_| {
            BillingError::InvalidInput(format!("subscription metadata tenant_id is not a UUID: {raw}"))
        })?;
        return Ok(Some(tenant_id));
    }

    if let Some(customer_id) = subscription.customer.as_deref() {
        if let Some(tenant_id) = store.find_tenant_for_customer(customer_id).await? {
            return Ok(Some(tenant_id));
        }
    }

    // The saga records the subscription id even when its own link failed.
    store
        .find_tenant_for_provisioned_subscription(&subscription.id)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventEnvelope, EventKind, StripeEvent};
    use crate::models::NewTenant;
    use crate::store::{FailPoint, MemoryBillingStore};
    use serde_json::json;

    fn subscription(value: serde_json::Value) -> SubscriptionObject {
        let body = json!({
            "id": "evt_1",
            "type": "customer.subscription.updated",
            "created": 1_700_000_000,
            "data": { "object": value }
        });
        let event: StripeEvent = EventEnvelope::from_slice(body.to_string().as_bytes())
            .unwrap()
            .into();
        match event.kind {
            EventKind::SubscriptionUpdated(sub) => sub,
            other => panic!("unexpected kind {other:?}"),
        }
    }

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(secs).unwrap()
    }

    async fn tenant(store: &MemoryBillingStore) -> Uuid {
        store
            .insert_tenant(NewTenant {
                name: "Grace Chapel".to_string(),
                slug: "grace-chapel".to_string(),
                settings: json!({}),
            })
            .await
            .id
    }

    #[tokio::test]
    async fn created_with_metadata_tenant_inserts_row() {
        let store = MemoryBillingStore::new();
        let tenant_id = tenant(&store).await;
        let plan = store.insert_plan("Basic", Some("price_basic")).await;

        let sub = subscription(json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": "trialing",
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
            "items": { "data": [{ "price": { "id": "price_basic" } }] },
            "metadata": { "tenant_id": tenant_id.to_string() }
        }));

        let outcome = handle_subscription_created(&store, at(1_700_000_000), &sub)
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::Applied);

        let row = store.subscription("sub_1").await.unwrap();
        assert_eq!(row.tenant_id, tenant_id);
        assert_eq!(row.plan_id, plan.id);
        assert_eq!(row.status, SubscriptionStatus::Trialing);
        assert_eq!(row.stripe_customer_id.as_deref(), Some("cus_1"));
    }

    #[tokio::test]
    async fn created_with_unknown_price_fails() {
        let store = MemoryBillingStore::new();
        let sub = subscription(json!({
            "id": "sub_1",
            "status": "active",
            "items": { "data": [{ "price": { "id": "price_missing" } }] }
        }));

        let err = handle_subscription_created(&store, at(1_700_000_000), &sub)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PlanNotFound(price) if price == "price_missing"));
        assert!(store.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn unlinked_subscription_is_skipped() {
        let store = MemoryBillingStore::new();
        store.insert_plan("Basic", Some("price_basic")).await;
        let sub = subscription(json!({
            "id": "sub_1",
            "customer": "cus_new",
            "status": "active",
            "items": { "data": [{ "price": { "id": "price_basic" } }] }
        }));

        let outcome = handle_subscription_created(&store, at(1_700_000_000), &sub)
            .await
            .unwrap();
        assert!(matches!(outcome, HandlerOutcome::Skipped(_)));
        assert!(store.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn older_update_does_not_overwrite_newer_state() {
        let store = MemoryBillingStore::new();
        let tenant_id = tenant(&store).await;
        store.insert_plan("Basic", Some("price_basic")).await;
        let items = json!({ "data": [{ "price": { "id": "price_basic" } }] });

        let newer = subscription(json!({
            "id": "sub_1", "status": "past_due", "items": items,
            "metadata": { "tenant_id": tenant_id.to_string() }
        }));
        let older = subscription(json!({
            "id": "sub_1", "status": "active", "items": items,
            "metadata": { "tenant_id": tenant_id.to_string() }
        }));

        handle_subscription_updated(&store, at(1_700_000_200), &newer)
            .await
            .unwrap();
        let outcome = handle_subscription_updated(&store, at(1_700_000_100), &older)
            .await
            .unwrap();

        assert!(matches!(outcome, HandlerOutcome::Skipped(_)));
        assert_eq!(
            store.subscription("sub_1").await.unwrap().status,
            SubscriptionStatus::PastDue
        );
    }

    #[tokio::test]
    async fn update_with_unknown_price_keeps_plan() {
        let store = MemoryBillingStore::new();
        let tenant_id = tenant(&store).await;
        let plan = store.insert_plan("Basic", Some("price_basic")).await;

        let created = subscription(json!({
            "id": "sub_1", "status": "active",
            "items": { "data": [{ "price": { "id": "price_basic" } }] },
            "metadata": { "tenant_id": tenant_id.to_string() }
        }));
        handle_subscription_created(&store, at(1_700_000_000), &created)
            .await
            .unwrap();

        let updated = subscription(json!({
            "id": "sub_1", "status": "active", "cancel_at_period_end": true,
            "items": { "data": [{ "price": { "id": "price_legacy" } }] }
        }));
        handle_subscription_updated(&store, at(1_700_000_100), &updated)
            .await
            .unwrap();

        let row = store.subscription("sub_1").await.unwrap();
        assert_eq!(row.plan_id, plan.id);
        assert!(row.cancel_at_period_end);
    }

    #[tokio::test]
    async fn tenant_resolved_from_customer_history() {
        let store = MemoryBillingStore::new();
        let tenant_id = tenant(&store).await;
        store.insert_plan("Basic", Some("price_basic")).await;
        let items = json!({ "data": [{ "price": { "id": "price_basic" } }] });

        let first = subscription(json!({
            "id": "sub_1", "customer": "cus_1", "status": "canceled", "items": items,
            "metadata": { "tenant_id": tenant_id.to_string() }
        }));
        handle_subscription_created(&store, at(1_700_000_000), &first)
            .await
            .unwrap();

        let second = subscription(json!({
            "id": "sub_2", "customer": "cus_1", "status": "active", "items": items
        }));
        handle_subscription_created(&store, at(1_700_000_100), &second)
            .await
            .unwrap();

        assert_eq!(store.subscription("sub_2").await.unwrap().tenant_id, tenant_id);
    }

    #[tokio::test]
    async fn deleted_marks_canceled() {
        let store = MemoryBillingStore::new();
        let tenant_id = tenant(&store).await;
        store.insert_plan("Basic", Some("price_basic")).await;
        let sub = subscription(json!({
            "id": "sub_1", "status": "active",
            "items": { "data": [{ "price": { "id": "price_basic" } }] },
            "metadata": { "tenant_id": tenant_id.to_string() }
        }));
        handle_subscription_created(&store, at(1_700_000_000), &sub)
            .await
            .unwrap();

        let deleted = subscription(json!({
            "id": "sub_1", "status": "canceled", "canceled_at": 1_700_000_500
        }));
        let outcome = handle_subscription_deleted(&store, at(1_700_000_500), &deleted)
            .await
            .unwrap();

        assert_eq!(outcome, HandlerOutcome::Applied);
        let row = store.subscription("sub_1").await.unwrap();
        assert_eq!(row.status, SubscriptionStatus::Canceled);
        assert_eq!(row.canceled_at.map(|t| t.unix_timestamp()), Some(1_700_000_500));
    }

    #[tokio::test]
    async fn deleted_unknown_subscription_is_noop() {
        let store = MemoryBillingStore::new();
        let deleted = subscription(json!({ "id": "sub_x", "status": "canceled" }));
        let outcome = handle_subscription_deleted(&store, at(1_700_000_000), &deleted)
            .await
            .unwrap();
        assert!(matches!(outcome, HandlerOutcome::Skipped(_)));
        assert_eq!(store.write_count().await, 0);
    }

    #[tokio::test]
    async fn storage_failure_propagates() {
        let store = MemoryBillingStore::new();
        let tenant_id = tenant(&store).await;
        store.insert_plan("Basic", Some("price_basic")).await;
        store.fail_on(FailPoint::UpsertSubscription).await;

        let sub = subscription(json!({
            "id": "sub_1", "status": "active",
            "items": { "data": [{ "price": { "id": "price_basic" } }] },
            "metadata": { "tenant_id": tenant_id.to_string() }
        }));
        let err = handle_subscription_created(&store, at(1_700_000_000), &sub)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Storage(_)));
    }
}
