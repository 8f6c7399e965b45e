//! Idempotent, bounded-retry execution of webhook handlers
//!
//! Each `(source, key)` pair runs its handler at most once to completion.
//! Failures leave the record `failed` so a redelivery can try again, up to
//! [`RetryPolicy::max_attempts`]. A `processing` record left behind by a
//! crashed worker is reclaimed once it is older than
//! [`RetryPolicy::stale_after`].

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;

use crate::error::BillingResult;
use crate::models::{ClaimRequest, ClaimResult};
use crate::sanitize::SanitizedPayload;
use crate::store::BillingStore;

/// Source name for Stripe webhook idempotency records.
pub const WEBHOOK_SOURCE: &str = "stripe";

pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;
pub const DEFAULT_STALE_AFTER_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub stale_after: time::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            stale_after: time::Duration::minutes(DEFAULT_STALE_AFTER_MINUTES),
        }
    }
}

/// What happened to a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "disposition")]
pub enum Disposition {
    /// Handler ran and succeeded.
    Processed,
    /// A previous attempt already succeeded; handler not run.
    AlreadyProcessed,
    /// Another worker holds the record; handler not run.
    InFlight,
    Failed { attempts: i32 },
    /// Attempts exhausted; handler not run.
    RetriesExhausted { attempts: i32 },
    /// The record could not be claimed at all.
    ClaimFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryOutcome {
    pub success: bool,
    pub error: Option<String>,
    #[serde(flatten)]
    pub disposition: Disposition,
}

impl RetryOutcome {
    fn succeeded(disposition: Disposition) -> Self {
        Self {
            success: true,
            error: None,
            disposition,
        }
    }

    fn failed(disposition: Disposition, error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
            disposition,
        }
    }

    /// Whether this outcome belongs in the event log. In-flight deliveries
    /// leave the row to the worker that owns them, and a redelivery that did
    /// not run the handler keeps the result already recorded.
    pub fn should_mark_log(&self, first_delivery: bool) -> bool {
        match self.disposition {
            Disposition::InFlight => false,
            Disposition::Processed | Disposition::Failed { .. } => true,
            Disposition::AlreadyProcessed
            | Disposition::RetriesExhausted { .. }
            | Disposition::ClaimFailed => first_delivery,
        }
    }
}

#[derive(Clone)]
pub struct RetryCoordinator {
    store: Arc<dyn BillingStore>,
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(store: Arc<dyn BillingStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `handler` under the idempotency record for `(source, key)`.
    pub async fn process<F, Fut, T>(
        &self,
        source: &str,
        key: &str,
        event_type: &str,
        payload: &SanitizedPayload,
        handler: F,
    ) -> RetryOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BillingResult<T>>,
    {
        self.run(source, key, event_type, payload, false, handler)
            .await
    }

    /// Operator replay: like [`process`](Self::process) but a failed or
    /// exhausted record starts over with a fresh attempt counter.
    pub async fn process_forced<F, Fut, T>(
        &self,
        source: &str,
        key: &str,
        event_type: &str,
        payload: &SanitizedPayload,
        handler: F,
    ) -> RetryOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BillingResult<T>>,
    {
        self.run(source, key, event_type, payload, true, handler)
            .await
    }

    async fn run<F, Fut, T>(
        &self,
        source: &str,
        key: &str,
        event_type: &str,
        payload: &SanitizedPayload,
        force: bool,
        handler: F,
    ) -> RetryOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BillingResult<T>>,
    {
        let payload_json = payload.to_json();
        let request = ClaimRequest {
            source,
            idempotency_key: key,
            event_type,
            payload: &payload_json,
            max_attempts: self.policy.max_attempts,
            stale_after: self.policy.stale_after,
            force,
        };

        let record = match self.store.claim(&request).await {
            Ok(ClaimResult::Acquired(record)) => record,
            Ok(ClaimResult::AlreadyCompleted) => {
                tracing::info!(
                    source = %source,
                    key = %key,
                    event_type = %event_type,
                    "Duplicate delivery - already processed successfully"
                );
                return RetryOutcome::succeeded(Disposition::AlreadyProcessed);
            }
            Ok(ClaimResult::InFlight) => {
                tracing::info!(
                    source = %source,
                    key = %key,
                    event_type = %event_type,
                    "Duplicate delivery - currently being processed by another worker"
                );
                return RetryOutcome::succeeded(Disposition::InFlight);
            }
            Ok(ClaimResult::RetriesExhausted(record)) => {
                tracing::error!(
                    source = %source,
                    key = %key,
                    event_type = %event_type,
                    attempts = record.attempts,
                    last_error = ?record.last_error,
                    "Retries exhausted; manual replay required"
                );
                return RetryOutcome::failed(
                    Disposition::RetriesExhausted {
                        attempts: record.attempts,
                    },
                    "Max retries exceeded".to_string(),
                );
            }
            Err(e) => {
                tracing::error!(
                    source = %source,
                    key = %key,
                    error = %e,
                    "Could not claim idempotency record; handler not run"
                );
                return RetryOutcome::failed(Disposition::ClaimFailed, e.to_string());
            }
        };

        tracing::debug!(
            source = %source,
            key = %key,
            attempt = record.attempts,
            forced = force,
            "Claimed exclusive processing rights"
        );

        match handler().await {
            Ok(_) => {
                if let Err(e) = self.store.complete(record.id).await {
                    // Record stays `processing` and is reclaimed after the
                    // stale window; handlers tolerate the re-run.
                    tracing::error!(
                        key = %key,
                        error = %e,
                        "Handler succeeded but idempotency record could not be completed"
                    );
                }
                RetryOutcome::succeeded(Disposition::Processed)
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(store_err) = self.store.fail(record.id, &message).await {
                    tracing::error!(
                        key = %key,
                        error = %store_err,
                        "Failed to record handler failure on idempotency record"
                    );
                }
                tracing::warn!(
                    source = %source,
                    key = %key,
                    event_type = %event_type,
                    attempt = record.attempts,
                    max_attempts = self.policy.max_attempts,
                    error = %message,
                    "Webhook handler failed"
                );
                RetryOutcome::failed(
                    Disposition::Failed {
                        attempts: record.attempts,
                    },
                    message,
                )
            }
        }
    }
}
