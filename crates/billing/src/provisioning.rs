//! New-tenant provisioning saga
//!
//! Runs when a "new tenant" checkout completes:
//!
//! 1. load the pending request (completed is a no-op, expired is rejected)
//! 2. mark it `payment_processing` (best effort)
//! 3. create the tenant, or resume one this request already created
//! 4. promote the requesting user to owner of the tenant
//! 5. link the Stripe subscription (best effort)
//! 6. mark the request `completed`
//!
//! Failures are typed by what they leave behind ([`StepFailure`]) and
//! unwound in one place: a failed owner promotion deletes the tenant created
//! in step 3, and every failure from step 3 on marks the request `failed`
//! with the error in its metadata. A failed request is retried by the next
//! delivery of the checkout event.

use congregate_shared::{PendingRequestStatus, SubscriptionStatus};
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::CheckoutSession;
use crate::models::{
    NewTenant, OwnerPromotion, PendingRequestUpdate, PendingTenantRequest, SubscriptionUpsert,
    Tenant,
};
use crate::store::BillingStore;

pub const PENDING_REQUEST_ID_KEY: &str = "pending_request_id";
pub const USER_ID_KEY: &str = "user_id";
pub const TENANT_NAME_KEY: &str = "tenant_name";
pub const TENANT_SLUG_KEY: &str = "tenant_slug";

pub const OWNER_ROLE: &str = "admin";
pub const OWNER_MEMBER_STAGE: &str = "leader";

/// Length of the first billing period written when the subscription is
/// linked; later subscription events replace it with Stripe's dates.
pub const INITIAL_PERIOD_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    Provisioned {
        tenant_id: Uuid,
        subscription_linked: bool,
    },
    /// The request was completed by an earlier delivery.
    AlreadyCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStep {
    CreateTenant,
    PromoteOwner,
    CompleteRequest,
}

impl SagaStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::CreateTenant => "create_tenant",
            SagaStep::PromoteOwner => "promote_owner",
            SagaStep::CompleteRequest => "complete_request",
        }
    }
}

/// Why a run stopped and what must be undone.
#[derive(Debug)]
enum StepFailure {
    /// Stopped before anything was written.
    Abort(BillingError),
    /// The request is marked failed; nothing to undo.
    Halt { step: SagaStep, error: BillingError },
    /// The tenant has no owner: delete it, then mark the request failed.
    Compensate {
        step: SagaStep,
        tenant_id: Uuid,
        error: BillingError,
    },
}

/// Checkout metadata the saga requires.
#[derive(Debug, Clone)]
struct ProvisioningInput {
    request_id: Uuid,
    user_id: Uuid,
    tenant_name: String,
    tenant_slug: String,
}

impl ProvisioningInput {
    fn from_session(session: &CheckoutSession) -> BillingResult<Self> {
        let required = |key: &'static str| {
            session
                .metadata_value(key)
                .ok_or(BillingError::MissingMetadata(key))
        };
        let uuid = |key: &'static str| -> BillingResult<Uuid> {
            let raw = required(key)?;
            Uuid::parse_str(raw)
                .map_err(|_| BillingError::InvalidInput(format!("{key} is not a UUID: {raw}")))
        };

        Ok(Self {
            request_id: uuid(PENDING_REQUEST_ID_KEY)?,
            user_id: uuid(USER_ID_KEY)?,
            tenant_name: required(TENANT_NAME_KEY)?.to_string(),
            tenant_slug: required(TENANT_SLUG_KEY)?.to_string(),
        })
    }
}

pub struct TenantProvisioningSaga<'a> {
    store: &'a dyn BillingStore,
}

impl<'a> TenantProvisioningSaga<'a> {
    pub fn new(store: &'a dyn BillingStore) -> Self {
        Self { store }
    }

    pub async fn run(
        &self,
        event_at: OffsetDateTime,
        session: &CheckoutSession,
    ) -> BillingResult<ProvisioningOutcome> {
        let input = ProvisioningInput::from_session(session).inspect_err(|e| {
            tracing::error!(
                session_id = %session.id,
                error = %e,
                "New-tenant checkout has unusable metadata"
            );
        })?;

        match self.execute(&input, event_at, session).await {
            Ok(outcome) => Ok(outcome),
            Err(failure) => Err(self.unwind(&input, failure).await),
        }
    }

    async fn execute(
        &self,
        input: &ProvisioningInput,
        event_at: OffsetDateTime,
        session: &CheckoutSession,
    ) -> Result<ProvisioningOutcome, StepFailure> {
        let request = self
            .store
            .get_pending_request(input.request_id)
            .await
            .map_err(StepFailure::Abort)?
            .ok_or(StepFailure::Abort(BillingError::RequestNotFound(
                input.request_id,
            )))?;

        match request.status {
            PendingRequestStatus::Completed => {
                tracing::info!(
                    request_id = %request.id,
                    "Pending tenant request already completed"
                );
                return Ok(ProvisioningOutcome::AlreadyCompleted);
            }
            PendingRequestStatus::Expired => {
                return Err(StepFailure::Abort(BillingError::InvalidRequestState {
                    id: request.id,
                    status: request.status.to_string(),
                }));
            }
            _ => {}
        }

        if let Err(e) = self
            .store
            .update_pending_request(
                request.id,
                &PendingRequestUpdate::status(PendingRequestStatus::PaymentProcessing),
            )
            .await
        {
            tracing::warn!(
                request_id = %request.id,
                error = %e,
                "Could not mark pending request as payment_processing; continuing"
            );
        }

        let tenant = self
            .create_or_resume_tenant(&request, input)
            .await
            .map_err(|error| StepFailure::Halt {
                step: SagaStep::CreateTenant,
                error,
            })?;

        self.store
            .promote_owner(&OwnerPromotion {
                user_id: input.user_id,
                tenant_id: tenant.id,
                role: OWNER_ROLE.to_string(),
                member_stage: OWNER_MEMBER_STAGE.to_string(),
            })
            .await
            .map_err(|error| StepFailure::Compensate {
                step: SagaStep::PromoteOwner,
                tenant_id: tenant.id,
                error: match error {
                    e @ BillingError::ProfileUpdateFailed(_) => e,
                    other => BillingError::ProfileUpdateFailed(other.to_string()),
                },
            })?;

        let subscription_linked = self
            .link_subscription(&request, tenant.id, session, event_at)
            .await;

        self.store
            .update_pending_request(
                request.id,
                &PendingRequestUpdate {
                    status: Some(PendingRequestStatus::Completed),
                    stripe_subscription_id: session.subscription.clone(),
                    completed_at: Some(OffsetDateTime::now_utc()),
                    metadata: None,
                },
            )
            .await
            .map_err(|error| StepFailure::Halt {
                step: SagaStep::CompleteRequest,
                error,
            })?;

        tracing::info!(
            request_id = %request.id,
            tenant_id = %tenant.id,
            user_id = %input.user_id,
            subscription_linked = subscription_linked,
            "Tenant provisioned from checkout"
        );

        Ok(ProvisioningOutcome::Provisioned {
            tenant_id: tenant.id,
            subscription_linked,
        })
    }

    /// A tenant carrying this request's id is resumed instead of recreated,
    /// so a retry after a later failure does not trip the slug constraint.
    async fn create_or_resume_tenant(
        &self,
        request: &PendingTenantRequest,
        input: &ProvisioningInput,
    ) -> BillingResult<Tenant> {
        let request_id = request.id.to_string();

        match self.store.find_tenant_by_slug(&input.tenant_slug).await {
            Ok(Some(existing))
                if existing
                    .settings
                    .get(PENDING_REQUEST_ID_KEY)
                    .and_then(|v| v.as_str())
                    == Some(request_id.as_str()) =>
            {
                tracing::info!(
                    request_id = %request.id,
                    tenant_id = %existing.id,
                    "Resuming tenant created by an earlier attempt"
                );
                return Ok(existing);
            }
            Ok(Some(_)) => {
                return Err(BillingError::TenantCreationFailed(format!(
                    "slug {} is already taken",
                    input.tenant_slug
                )));
            }
            Ok(None) => {}
            Err(e) => return Err(BillingError::TenantCreationFailed(e.to_string())),
        }

        self.store
            .create_tenant(&NewTenant {
                name: input.tenant_name.clone(),
                slug: input.tenant_slug.clone(),
                settings: json!({
                    PENDING_REQUEST_ID_KEY: request_id,
                    "plan_id": request.plan_id,
                }),
            })
            .await
            .map_err(|e| BillingError::TenantCreationFailed(e.to_string()))
    }

    /// Best effort: the subscription events that follow checkout converge
    /// the row if this write is missed.
    async fn link_subscription(
        &self,
        request: &PendingTenantRequest,
        tenant_id: Uuid,
        session: &CheckoutSession,
        event_at: OffsetDateTime,
    ) -> bool {
        let Some(stripe_subscription_id) = session.subscription.as_deref() else {
            tracing::warn!(
                request_id = %request.id,
                session_id = %session.id,
                "Checkout completed without a subscription"
            );
            return false;
        };
        let Some(plan_id) = request.plan_id else {
            tracing::warn!(request_id = %request.id, "Pending request has no plan");
            return false;
        };

        match self.store.get_plan(plan_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(
                    request_id = %request.id,
                    plan_id = %plan_id,
                    "Plan not found; subscription will sync from later events"
                );
                return false;
            }
            Err(e) => {
                tracing::error!(
                    request_id = %request.id,
                    error = %e,
                    "Plan lookup failed; subscription will sync from later events"
                );
                return false;
            }
        }

        let period_start = OffsetDateTime::now_utc();
        let result = self
            .store
            .upsert_subscription(&SubscriptionUpsert {
                tenant_id,
                plan_id,
                stripe_subscription_id: stripe_subscription_id.to_string(),
                stripe_customer_id: session.customer.clone(),
                status: SubscriptionStatus::Active,
                current_period_start: Some(period_start),
                current_period_end: Some(period_start + time::Duration::days(INITIAL_PERIOD_DAYS)),
                cancel_at_period_end: false,
                canceled_at: None,
                event_at,
            })
            .await;

        match result {
            Ok(linked) => linked,
            Err(e) => {
                tracing::error!(
                    request_id = %request.id,
                    tenant_id = %tenant_id,
                    subscription_id = %stripe_subscription_id,
                    error = %e,
                    "Failed to link subscription; subscription will sync from later events"
                );
                false
            }
        }
    }

    async fn unwind(&self, input: &ProvisioningInput, failure: StepFailure) -> BillingError {
        let (step, error) = match failure {
            StepFailure::Abort(error) => {
                tracing::error!(
                    request_id = %input.request_id,
                    error = %error,
                    "Tenant provisioning aborted"
                );
                return error;
            }
            StepFailure::Halt { step, error } => (step, error),
            StepFailure::Compensate {
                step,
                tenant_id,
                error,
            } => {
                match self.store.delete_tenant(tenant_id).await {
                    Ok(_) => tracing::warn!(
                        request_id = %input.request_id,
                        tenant_id = %tenant_id,
                        "Rolled back tenant after owner promotion failed"
                    ),
                    Err(e) => tracing::error!(
                        request_id = %input.request_id,
                        tenant_id = %tenant_id,
                        error = %e,
                        "CRITICAL: Failed to roll back tenant; manual cleanup required"
                    ),
                }
                (step, error)
            }
        };

        tracing::error!(
            request_id = %input.request_id,
            step = step.as_str(),
            error = %error,
            "Tenant provisioning failed"
        );

        let failed_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let update = PendingRequestUpdate {
            status: Some(PendingRequestStatus::Failed),
            metadata: Some(json!({
                "error": error.to_string(),
                "failed_step": step.as_str(),
                "failed_at": failed_at,
            })),
            ..Default::default()
        };
        if let Err(e) = self
            .store
            .update_pending_request(input.request_id, &update)
            .await
        {
            tracing::error!(
                request_id = %input.request_id,
                error = %e,
                "Failed to mark pending tenant request as failed"
            );
        }

        error
    }
}
