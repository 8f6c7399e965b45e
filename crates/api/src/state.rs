//! Application state

use std::sync::Arc;

use congregate_billing::{BillingService, BillingStore};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn BillingStore>) -> Self {
        let billing = BillingService::new(config.stripe.clone(), config.retry_policy, store);

        if config.admin_api_token.is_some() {
            tracing::info!("Admin webhook routes enabled");
        } else {
            tracing::warn!("ADMIN_API_TOKEN not set; admin webhook routes disabled");
        }

        Self {
            config,
            billing: Arc::new(billing),
        }
    }
}
