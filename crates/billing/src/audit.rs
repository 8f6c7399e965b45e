//! Audit trail for webhook outcomes
//!
//! Entries go to the `audit` tracing target so they can be routed apart from
//! operational logs. Only sanitized context is ever passed in.

use serde_json::Value;

pub const AUDIT_TARGET: &str = "audit";

/// Record the outcome of one webhook delivery or replay.
pub fn webhook(source: &str, event_type: &str, success: bool, context: &Value) {
    if success {
        tracing::info!(
            target: AUDIT_TARGET,
            source = source,
            event_type = event_type,
            success = success,
            context = %context,
            "webhook processed"
        );
    } else {
        tracing::warn!(
            target: AUDIT_TARGET,
            source = source,
            event_type = event_type,
            success = success,
            context = %context,
            "webhook processing failed"
        );
    }
}
