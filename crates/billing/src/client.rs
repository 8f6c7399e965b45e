//! Stripe API access
//!
//! Webhook processing itself never calls Stripe. The API is only used to
//! re-fetch events for operator replay, where the event log holds nothing
//! but the sanitized payload.

use async_trait::async_trait;

use crate::error::{BillingError, BillingResult};

/// Stripe credentials. Either may be absent: without a webhook secret every
/// delivery is rejected, without a secret key replay is unavailable.
#[derive(Clone, Default)]
pub struct StripeConfig {
    pub secret_key: Option<String>,
    pub webhook_secret: Option<String>,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &self.secret_key.as_ref().map(|_| "[redacted]"))
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "[redacted]"),
            )
            .finish()
    }
}

/// Where replayed events come from.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Raw JSON of the event as Stripe currently reports it.
    async fn fetch_event(&self, event_id: &str) -> BillingResult<Vec<u8>>;
}

#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
}

impl StripeClient {
    pub fn new(secret_key: &str) -> Self {
        Self {
            inner: stripe::Client::new(secret_key),
        }
    }

    pub fn from_config(config: &StripeConfig) -> Option<Self> {
        config.secret_key.as_deref().map(Self::new)
    }
}

#[async_trait]
impl EventSource for StripeClient {
    async fn fetch_event(&self, event_id: &str) -> BillingResult<Vec<u8>> {
        let id: stripe::EventId = event_id
            .parse()
            .map_err(|e| BillingError::InvalidInput(format!("invalid event id {event_id}: {e}")))?;

        let event: serde_json::Value = self
            .inner
            .get(&format!("/events/{id}"))
            .await
            .map_err(|e| {
                tracing::error!(event_id = %id, error = %e, "Failed to fetch event from Stripe");
                BillingError::from(e)
            })?;

        serde_json::to_vec(&event).map_err(|e| BillingError::StripeApi(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secrets() {
        let config = StripeConfig {
            secret_key: Some("sk_test_123".to_string()),
            webhook_secret: Some("whsec_abc".to_string()),
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk_test_123"));
        assert!(!rendered.contains("whsec_abc"));
        assert!(rendered.contains("[redacted]"));
    }

    #[test]
    fn client_requires_secret_key() {
        assert!(StripeClient::from_config(&StripeConfig::default()).is_none());
    }

    #[tokio::test]
    async fn rejects_non_event_ids() {
        let client = StripeClient::new("sk_test_123");
        let err = client.fetch_event("in_123").await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }
}
