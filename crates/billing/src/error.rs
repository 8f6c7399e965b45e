//! Billing error types

use congregate_shared::UnknownStatus;
use uuid::Uuid;

/// Errors raised while verifying and processing Stripe webhooks.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Missing stripe-signature header")]
    MissingSignature,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Billing misconfigured: {0}")]
    Misconfigured(String),

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Missing checkout metadata: {0}")]
    MissingMetadata(&'static str),

    #[error("Pending tenant request not found: {0}")]
    RequestNotFound(Uuid),

    #[error("Pending tenant request {id} is {status}")]
    InvalidRequestState { id: Uuid, status: String },

    #[error("Tenant creation failed: {0}")]
    TenantCreationFailed(String),

    #[error("Owner profile update failed: {0}")]
    ProfileUpdateFailed(String),

    #[error("No subscription plan for price {0}")]
    PlanNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl BillingError {
    /// Errors that reject the delivery before anything is recorded.
    pub fn is_verification_error(&self) -> bool {
        matches!(
            self,
            Self::MissingSignature
                | Self::InvalidSignature
                | Self::Misconfigured(_)
                | Self::MalformedPayload(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Storage(err.to_string())
    }
}

impl From<UnknownStatus> for BillingError {
    fn from(err: UnknownStatus) -> Self {
        BillingError::InvalidInput(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
