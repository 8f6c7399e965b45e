//! Congregate Background Worker
//!
//! Handles scheduled jobs:
//! - Replay of failed Stripe webhook events with attempts left (every 15
//!   minutes by default); exhausted events wait for an operator replay
//! - Heartbeat (every 5 minutes)
//!
//! Without `STRIPE_SECRET_KEY` events cannot be re-fetched, so the worker
//! only logs a heartbeat.

use std::sync::Arc;
use std::time::Duration;

use congregate_api::Config;
use congregate_billing::{BillingService, PgBillingStore, WebhookReplayResult};
use congregate_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_REPLAY_CRON: &str = "0 */15 * * * *";
const DEFAULT_REPLAY_BATCH: i64 = 25;

/// Counts of one replay cycle: (recovered, still failing).
fn summarize(results: &[WebhookReplayResult]) -> (usize, usize) {
    let recovered = results.iter().filter(|r| r.success).count();
    (recovered, results.len() - recovered)
}

fn log_replay_results(results: &[WebhookReplayResult]) {
    let (recovered, failing) = summarize(results);
    info!(
        attempted = results.len(),
        recovered = recovered,
        failing = failing,
        "Webhook replay cycle complete"
    );

    for result in results.iter().filter(|r| !r.success) {
        error!(
            stripe_event_id = %result.stripe_event_id,
            event_type = %result.event_type,
            error = ?result.new_error,
            "Webhook still failing after replay"
        );
    }
}

fn replay_batch() -> i64 {
    match std::env::var("WEBHOOK_REPLAY_BATCH") {
        Ok(raw) => match raw.trim().parse::<i64>() {
            Ok(batch) if batch > 0 => batch,
            _ => {
                warn!(value = %raw, "Invalid WEBHOOK_REPLAY_BATCH; using default");
                DEFAULT_REPLAY_BATCH
            }
        },
        Err(_) => DEFAULT_REPLAY_BATCH,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Congregate Worker");

    let config = Config::from_env()?;

    if config.stripe.secret_key.is_none() {
        // Replay needs the Stripe API; run in minimal mode
        warn!("STRIPE_SECRET_KEY not set - running in minimal mode");
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            info!("Worker heartbeat (minimal mode)");
        }
    }

    let pool = create_pool(&config.database_url).await?;
    let billing = Arc::new(BillingService::new(
        config.stripe.clone(),
        config.retry_policy,
        Arc::new(PgBillingStore::new(pool)),
    ));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Replay failed webhook events
    let replay_cron =
        std::env::var("WEBHOOK_REPLAY_CRON").unwrap_or_else(|_| DEFAULT_REPLAY_CRON.to_string());
    let batch = replay_batch();
    let replay_billing = billing.clone();
    scheduler
        .add(Job::new_async(replay_cron.as_str(), move |_uuid, _l| {
            let billing = replay_billing.clone();
            Box::pin(async move {
                info!(batch = batch, "Running scheduled webhook replay");
                match billing.webhooks.replay_all_failed(Some(batch)).await {
                    Ok(results) if results.is_empty() => {
                        info!("No failed webhooks to replay");
                    }
                    Ok(results) => log_replay_results(&results),
                    Err(e) => error!(error = %e, "Failed to list failed webhooks"),
                }
            })
        })?)
        .await?;
    info!(cron = %replay_cron, batch = batch, "Scheduled: Webhook replay");

    // Job 2: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Congregate Worker started successfully with 2 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn result(success: bool) -> WebhookReplayResult {
        WebhookReplayResult {
            record_id: Uuid::new_v4(),
            stripe_event_id: "evt_1".to_string(),
            event_type: "invoice.paid".to_string(),
            previous_status: "failed".to_string(),
            previous_error: Some("boom".to_string()),
            new_status: if success { "processed" } else { "failed" }.to_string(),
            new_error: (!success).then(|| "boom".to_string()),
            success,
        }
    }

    #[test]
    fn summary_counts_recovered_and_failing() {
        let results = [result(true), result(false), result(true)];
        assert_eq!(summarize(&results), (2, 1));
        assert_eq!(summarize(&[]), (0, 0));
    }
}
