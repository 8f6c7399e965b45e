//! Status enums stored as text columns
//!
//! Each enum round-trips through its `as_str` form, which is also the value
//! Stripe uses where the status originates there.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A status string that does not name any known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} status: {value}")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err(UnknownStatus {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum! {
    /// Lifecycle of a "new tenant via checkout" request
    PendingRequestStatus, "pending request" {
        PendingPayment => "pending_payment",
        PaymentProcessing => "payment_processing",
        Completed => "completed",
        Failed => "failed",
        Expired => "expired",
    }
}

impl PendingRequestStatus {
    /// `completed` and `expired` are never reprocessed. `failed` stays
    /// retryable through redelivery of the triggering event.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired)
    }
}

text_enum! {
    /// Stripe subscription status as mirrored into `tenant_subscriptions`
    SubscriptionStatus, "subscription" {
        Active => "active",
        PastDue => "past_due",
        Canceled => "canceled",
        Unpaid => "unpaid",
        Trialing => "trialing",
        Incomplete => "incomplete",
        IncompleteExpired => "incomplete_expired",
        Paused => "paused",
    }
}

text_enum! {
    /// Invoice ledger row status
    InvoiceStatus, "invoice" {
        Paid => "paid",
        Failed => "failed",
    }
}

text_enum! {
    /// State of an idempotency record in `webhook_idempotency`
    ProcessingState, "processing" {
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_status_matches_stripe_strings() {
        assert_eq!(
            "past_due".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::PastDue
        );
        assert_eq!(SubscriptionStatus::IncompleteExpired.as_str(), "incomplete_expired");
    }

    #[test]
    fn unknown_status_names_its_kind() {
        let err = "archived".parse::<PendingRequestStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown pending request status: archived");
    }

    #[test]
    fn failed_requests_are_not_final() {
        assert!(PendingRequestStatus::Completed.is_final());
        assert!(PendingRequestStatus::Expired.is_final());
        assert!(!PendingRequestStatus::Failed.is_final());
        assert!(!PendingRequestStatus::PaymentProcessing.is_final());
    }
}
