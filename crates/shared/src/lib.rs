#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Congregate shared building blocks
//!
//! Database pool construction, migrations, and the status enums that the
//! billing crate persists as text columns.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{
    InvoiceStatus, PendingRequestStatus, ProcessingState, SubscriptionStatus, UnknownStatus,
};
