//! Invoice payment outcomes
//!
//! `invoice.paid` and `invoice.payment_failed` move the tracked subscription's
//! status and append to the invoice ledger. Invoices for subscriptions this
//! service does not track are ignored.

use congregate_shared::{InvoiceStatus, SubscriptionStatus};
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::events::InvoiceObject;
use crate::models::{NewInvoice, SubscriptionStatusChange};
use crate::router::HandlerOutcome;
use crate::store::BillingStore;

pub async fn handle_invoice_paid(
    store: &dyn BillingStore,
    event_at: OffsetDateTime,
    invoice: &InvoiceObject,
) -> BillingResult<HandlerOutcome> {
    record_invoice(
        store,
        event_at,
        invoice,
        InvoiceStatus::Paid,
        SubscriptionStatus::Active,
    )
    .await
}

pub async fn handle_invoice_payment_failed(
    store: &dyn BillingStore,
    event_at: OffsetDateTime,
    invoice: &InvoiceObject,
) -> BillingResult<HandlerOutcome> {
    record_invoice(
        store,
        event_at,
        invoice,
        InvoiceStatus::Failed,
        SubscriptionStatus::PastDue,
    )
    .await
}

async fn record_invoice(
    store: &dyn BillingStore,
    event_at: OffsetDateTime,
    invoice: &InvoiceObject,
    invoice_status: InvoiceStatus,
    subscription_status: SubscriptionStatus,
) -> BillingResult<HandlerOutcome> {
    let Some(stripe_subscription_id) = invoice.subscription_id() else {
        return Ok(HandlerOutcome::skipped("invoice has no subscription"));
    };
    let Some(subscription) = store.find_subscription(stripe_subscription_id).await? else {
        tracing::warn!(
            invoice_id = %invoice.id,
            subscription_id = %stripe_subscription_id,
            "Invoice for untracked subscription"
        );
        return Ok(HandlerOutcome::skipped("subscription not tracked"));
    };

    // A final invoice on a canceled subscription must not revive it.
    if subscription.status == SubscriptionStatus::Canceled {
        tracing::info!(
            invoice_id = %invoice.id,
            subscription_id = %stripe_subscription_id,
            "Subscription already canceled; status left unchanged"
        );
    } else {
        let applied = store
            .update_subscription_status(&SubscriptionStatusChange {
                stripe_subscription_id: stripe_subscription_id.to_string(),
                status: subscription_status,
                cancel_at_period_end: None,
                canceled_at: None,
                event_at,
            })
            .await?;
        if !applied {
            tracing::debug!(
                invoice_id = %invoice.id,
                subscription_id = %stripe_subscription_id,
                "Subscription has newer state; status left unchanged"
            );
        }
    }

    let paid = invoice_status == InvoiceStatus::Paid;
    let inserted = store
        .insert_invoice(&NewInvoice {
            tenant_id: subscription.tenant_id,
            subscription_id: subscription.id,
            stripe_invoice_id: invoice.id.clone(),
            stripe_payment_intent_id: invoice.payment_intent.clone(),
            amount_cents: if paid {
                invoice.amount_paid
            } else {
                invoice.amount_due
            },
            currency: invoice.currency().to_string(),
            status: invoice_status,
            paid_at: if paid {
                Some(invoice.paid_at().unwrap_or(event_at))
            } else {
                None
            },
            payment_method: invoice.payment_method().map(str::to_string),
        })
        .await?;

    if !inserted {
        tracing::debug!(
            invoice_id = %invoice.id,
            status = %invoice_status,
            "Invoice already recorded"
        );
    }

    if paid {
        tracing::info!(
            invoice_id = %invoice.id,
            tenant_id = %subscription.tenant_id,
            amount_cents = invoice.amount_paid,
            "Invoice paid"
        );
    } else {
        tracing::warn!(
            invoice_id = %invoice.id,
            tenant_id = %subscription.tenant_id,
            amount_cents = invoice.amount_due,
            "Invoice payment failed; subscription marked past_due"
        );
    }
    Ok(HandlerOutcome::Applied)
}
