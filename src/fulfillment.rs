//! Post-payment fulfillment pipeline.
//!
//! The webhook handler only claims the order row and returns; everything
//! that talks to a remote service runs here, in spawned tasks or the
//! background reconciler. Each order moves through the state machine in
//! `models::FulfillmentStatus`; failed steps stay visible in the database
//! so they can be resumed instead of silently lost.

use std::time::Duration;

use crate::db::{AppState, queries};
use crate::email::OrderConfirmation;
use crate::error::{AppError, Result};
use crate::models::{CatalogItem, FulfillmentStatus, OrderRecord};

/// Provisioning gives up after this many recorded failures. Orders at the
/// cap are logged at ERROR for operator follow-up.
pub const MAX_PROVISION_ATTEMPTS: i64 = 5;

/// How often the reconciler scans for resumable orders.
const RECONCILE_INTERVAL_SECS: u64 = 60;

/// Pending orders untouched for this long are assumed to have lost their
/// handler (crash, restart) and are picked up by the reconciler.
const PENDING_STALE_SECS: i64 = 300;

/// Address sent upstream when the payment processor supplied no email.
/// The provisioning API requires one; the confirmation email is skipped.
const PLACEHOLDER_EMAIL: &str = "no-email@example.com";

/// Delay before the nth provisioning retry: 60 * 2^attempts seconds.
pub fn provision_backoff_secs(attempts: i64) -> i64 {
    60 * (1i64 << attempts.clamp(0, 10))
}

/// Split a free-form customer name into the first/last pair the upstream
/// order endpoint expects.
fn split_name(name: &str) -> (&str, &str) {
    match name.trim().split_once(' ') {
        Some((first, last)) => (first, last),
        None => (name, name),
    }
}

/// Run provisioning for a claimed order in the background.
pub fn spawn_provisioning(state: AppState, order_id: String) {
    tokio::spawn(async move {
        if let Err(e) = provision_order(&state, &order_id).await {
            tracing::error!(order_id = %order_id, "Provisioning task failed: {}", e);
        }
    });
}

/// Provision one order upstream and persist the result.
///
/// On upstream failure the order is moved to `failed_provisioning` with the
/// error recorded and the attempt counter bumped; the reconciler retries it
/// after backoff. Database errors propagate to the caller.
pub async fn provision_order(state: &AppState, order_id: &str) -> Result<()> {
    let (order, item) = {
        let conn = state.db.get()?;
        let Some(order) = queries::get_order_by_id(&conn, order_id)? else {
            return Err(AppError::NotFound(format!("Order not found: {}", order_id)));
        };
        let Some(item) = queries::get_catalog_item_by_id(&conn, &order.catalog_item_id)? else {
            return Err(AppError::Internal(format!(
                "Catalog item missing for order {}",
                order_id
            )));
        };
        (order, item)
    };

    if !matches!(
        order.fulfillment_status,
        FulfillmentStatus::PendingProvisioning | FulfillmentStatus::FailedProvisioning
    ) {
        tracing::debug!(
            order_id,
            status = %order.fulfillment_status,
            "Order already past provisioning, nothing to do"
        );
        return Ok(());
    }

    let email = order.email.as_deref().unwrap_or(PLACEHOLDER_EMAIL);
    let name = order.customer_name.as_deref().unwrap_or("Customer");
    let (first_name, last_name) = split_name(name);

    match state
        .provisioning
        .create_order(&item.provider_package_id, email, first_name, last_name)
        .await
    {
        Ok(result) => {
            let conn = state.db.get()?;
            queries::mark_order_provisioned(&conn, order_id, &result)?;
            tracing::info!(
                order_id,
                upstream_order_id = %result.id,
                session = %order.payment_session_id,
                "Order provisioned"
            );
            Ok(())
        }
        Err(e) => {
            let conn = state.db.get()?;
            let attempts = queries::mark_provision_failed(&conn, order_id, &e.to_string())?;
            match attempts {
                Some(n) if n >= MAX_PROVISION_ATTEMPTS => {
                    tracing::error!(
                        order_id,
                        session = %order.payment_session_id,
                        attempts = n,
                        "Provisioning failed at attempt cap, manual follow-up required: {}",
                        e
                    );
                }
                Some(n) => {
                    tracing::warn!(
                        order_id,
                        attempts = n,
                        retry_in_secs = provision_backoff_secs(n),
                        "Provisioning failed, will retry: {}",
                        e
                    );
                }
                None => {
                    tracing::debug!(order_id, "Order state moved on, failure not recorded");
                }
            }
            Ok(())
        }
    }
}

/// Dispatch the confirmation email for a provisioned order in the background.
pub fn spawn_notification(state: AppState, order_id: String) {
    tokio::spawn(async move {
        if let Err(e) = dispatch_confirmation(&state, &order_id).await {
            tracing::error!(order_id = %order_id, "Notification dispatch failed: {}", e);
        }
    });
}

/// Send the confirmation email once the activation artifact is visible.
///
/// The status flip to `notified` happens before the send, atomically, so
/// at most one of any number of concurrent callers dispatches. A failed
/// send demotes the order to `failed_notification` for the manual resend.
/// Returns whether this call was the one that dispatched.
pub async fn dispatch_confirmation(state: &AppState, order_id: &str) -> Result<bool> {
    let (order, item) = {
        let conn = state.db.get()?;
        let Some(order) = queries::get_order_by_id(&conn, order_id)? else {
            return Err(AppError::NotFound(format!("Order not found: {}", order_id)));
        };
        let Some(item) = queries::get_catalog_item_by_id(&conn, &order.catalog_item_id)? else {
            return Err(AppError::Internal(format!(
                "Catalog item missing for order {}",
                order_id
            )));
        };
        if !queries::try_claim_notification(&conn, order_id)? {
            return Ok(false);
        }
        (order, item)
    };

    match send_confirmation(state, &order, &item).await {
        Ok(()) => Ok(true),
        Err(e) => {
            let conn = state.db.get()?;
            queries::mark_notification_failed(&conn, order_id, &e.to_string())?;
            Err(e)
        }
    }
}

/// Manual resend of the confirmation email, from the success page.
///
/// Allowed once the order has been through a dispatch (`notified` or
/// `failed_notification`). Runs synchronously so the caller sees the result.
pub async fn resend_confirmation(state: &AppState, order: &OrderRecord) -> Result<()> {
    if !matches!(
        order.fulfillment_status,
        FulfillmentStatus::Notified | FulfillmentStatus::FailedNotification
    ) {
        return Err(AppError::Conflict(format!(
            "Order is not ready for resend (status: {})",
            order.fulfillment_status
        )));
    }

    let item = {
        let conn = state.db.get()?;
        queries::get_catalog_item_by_id(&conn, &order.catalog_item_id)?.ok_or_else(|| {
            AppError::Internal(format!("Catalog item missing for order {}", order.id))
        })?
    };

    match send_confirmation(state, order, &item).await {
        Ok(()) => {
            let conn = state.db.get()?;
            queries::mark_notified(&conn, &order.id)?;
            Ok(())
        }
        Err(e) => {
            let conn = state.db.get()?;
            queries::mark_notification_failed(&conn, &order.id, &e.to_string())?;
            Err(e)
        }
    }
}

async fn send_confirmation(state: &AppState, order: &OrderRecord, item: &CatalogItem) -> Result<()> {
    let Some(email) = order.email.as_deref() else {
        return Err(AppError::Conflict("Order has no customer email".into()));
    };
    let Some(qr_code_url) = order.qr_code_url.as_deref() else {
        return Err(AppError::Conflict("Order has no activation artifact".into()));
    };

    state
        .email
        .send_order_confirmation(OrderConfirmation {
            to_email: email,
            customer_name: order.customer_name.as_deref().unwrap_or("Customer"),
            package_name: &item.name,
            region: item.region.as_deref(),
            data_amount: item.data_amount,
            data_unit: &item.data_unit,
            validity_days: item.validity_days,
            qr_code_url,
            direct_install_url: order.direct_install_url.as_deref(),
        })
        .await?;

    Ok(())
}

/// Spawns the background reconciler that resumes stuck orders.
///
/// Every cycle it retries `failed_provisioning` orders whose backoff has
/// elapsed and re-runs `pending_provisioning` orders whose handler died
/// before reaching upstream.
pub fn spawn_reconciler(state: AppState) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(RECONCILE_INTERVAL_SECS);

        loop {
            tokio::time::sleep(interval).await;

            if let Err(e) = reconcile(&state).await {
                tracing::warn!("Fulfillment reconciler cycle failed: {}", e);
            }
        }
    });

    tracing::info!(
        "Background fulfillment reconciler started (runs every {} seconds)",
        RECONCILE_INTERVAL_SECS
    );
}

/// One reconciler cycle. Public so tests can drive it directly.
pub async fn reconcile(state: &AppState) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    let (failed, stale) = {
        let conn = state.db.get()?;
        let failed = queries::list_failed_provisioning(&conn, MAX_PROVISION_ATTEMPTS)?;
        let stale = queries::list_stale_pending(&conn, now - PENDING_STALE_SECS)?;
        (failed, stale)
    };

    for order in failed {
        if order.updated_at + provision_backoff_secs(order.provision_attempts) > now {
            continue;
        }
        tracing::info!(
            order_id = %order.id,
            attempts = order.provision_attempts,
            "Reconciler retrying failed provisioning"
        );
        provision_order(state, &order.id).await?;
    }

    for order in stale {
        tracing::info!(order_id = %order.id, "Reconciler resuming stale pending order");
        provision_order(state, &order.id).await?;
    }

    Ok(())
}
