//! Checkout session events

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::CheckoutSession;
use crate::provisioning::{ProvisioningOutcome, TenantProvisioningSaga, PENDING_REQUEST_ID_KEY};
use crate::router::HandlerOutcome;
use crate::store::BillingStore;

/// Metadata tag that routes a checkout into tenant provisioning.
pub const CHECKOUT_TYPE_KEY: &str = "checkout_type";
pub const NEW_TENANT_CHECKOUT: &str = "new_tenant";

pub fn is_new_tenant_checkout(session: &CheckoutSession) -> bool {
    session.metadata_value(CHECKOUT_TYPE_KEY) == Some(NEW_TENANT_CHECKOUT)
}

pub async fn handle_checkout_completed(
    store: &dyn BillingStore,
    event_at: OffsetDateTime,
    session: &CheckoutSession,
) -> BillingResult<HandlerOutcome> {
    if !is_new_tenant_checkout(session) {
        return Ok(HandlerOutcome::skipped("not a new-tenant checkout"));
    }

    match TenantProvisioningSaga::new(store)
        .run(event_at, session)
        .await?
    {
        ProvisioningOutcome::Provisioned { .. } => Ok(HandlerOutcome::Applied),
        ProvisioningOutcome::AlreadyCompleted => {
            Ok(HandlerOutcome::skipped("pending request already completed"))
        }
    }
}

/// An abandoned checkout expires its pending request. Only requests still
/// awaiting payment move; any later status is left alone.
pub async fn handle_checkout_expired(
    store: &dyn BillingStore,
    session: &CheckoutSession,
) -> BillingResult<HandlerOutcome> {
    let Some(raw) = session.metadata_value(PENDING_REQUEST_ID_KEY) else {
        return Ok(HandlerOutcome::skipped("checkout has no pending request"));
    };
    let request_id = Uuid::parse_str(raw).map_err(|_| {
        BillingError::InvalidInput(format!("{PENDING_REQUEST_ID_KEY} is not a UUID: {raw}"))
    })?;

    if store.expire_pending_request(request_id).await? {
        tracing::info!(
            request_id = %request_id,
            session_id = %session.id,
            "Pending tenant request expired with its checkout session"
        );
        Ok(HandlerOutcome::Applied)
    } else {
        Ok(HandlerOutcome::skipped("pending request is not awaiting payment"))
    }
}
