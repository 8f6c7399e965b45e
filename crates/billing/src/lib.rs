// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries owned context strings
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Congregate Billing Module
//!
//! Receives Stripe webhooks and turns them into tenant state.
//!
//! ## Features
//!
//! - **Signature Verification**: HMAC-SHA256 over the raw body with timestamp tolerance
//! - **Sanitized Event Log**: Every event is logged without customer PII
//! - **Idempotent Retries**: Each event runs to completion at most once, with bounded retries
//! - **Tenant Provisioning**: New-tenant checkouts create the tenant and its owner
//! - **Subscription Sync**: Subscription and invoice events mirrored per tenant
//! - **Replay**: Failed events can be re-fetched from Stripe and re-processed

pub mod audit;
pub mod checkout;
pub mod client;
pub mod error;
pub mod event_log;
pub mod events;
pub mod invoices;
pub mod models;
pub mod provisioning;
pub mod retry;
pub mod router;
pub mod sanitize;
pub mod signature;
pub mod store;
pub mod subscriptions;
pub mod webhooks;


use std::sync::Arc;

// Client
pub use client::{EventSource, StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventEnvelope, EventKind, StripeEvent};

// Models
pub use models::{EventLogFilter, WebhookEventRecord};

// Provisioning
pub use provisioning::{ProvisioningOutcome, TenantProvisioningSaga};

// Retry
pub use retry::{Disposition, RetryCoordinator, RetryOutcome, RetryPolicy};

// Router
pub use router::{EventRouter, HandlerOutcome};

// Sanitize
pub use sanitize::{sanitize, SanitizedPayload};

// Signature
pub use signature::{sign_payload, SignatureVerifier};

// Store
pub use store::{BillingStore, MemoryBillingStore, PgBillingStore};

// Webhooks
pub use webhooks::{DeliveryReport, WebhookHandler, WebhookReplayResult};

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub webhooks: WebhookHandler,
}

impl BillingService {
    pub fn new(config: StripeConfig, policy: RetryPolicy, store: Arc<dyn BillingStore>) -> Self {
        let verifier = SignatureVerifier::new(config.webhook_secret.clone());
        if !verifier.is_configured() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set; all webhook deliveries will be rejected");
        }

        let mut webhooks = WebhookHandler::new(verifier, store, policy);
        match StripeClient::from_config(&config) {
            Some(client) => webhooks = webhooks.with_event_source(Arc::new(client)),
            None => tracing::warn!("STRIPE_SECRET_KEY not set; webhook replay disabled"),
        }

        Self { webhooks }
    }
}
