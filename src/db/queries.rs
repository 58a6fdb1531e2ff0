use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;
use crate::provisioning::ProvisioningOrder;

use super::from_row::{CATALOG_ITEM_COLS, ORDER_COLS, query_all, query_one};

fn now() -> i64 {
    Utc::now().timestamp()
}

fn gen_id() -> String {
    Uuid::new_v4().to_string()
}

// ============ Catalog Items ============

pub fn create_catalog_item(conn: &Connection, input: &CreateCatalogItem) -> Result<CatalogItem> {
    let id = gen_id();
    let now = now();
    let prices = serde_json::to_string(&input.prices)?;

    conn.execute(
        "INSERT INTO catalog_items (id, name, region, data_amount, data_unit, validity_days, prices, provider_package_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            &id,
            &input.name,
            &input.region,
            input.data_amount,
            &input.data_unit,
            input.validity_days,
            &prices,
            &input.provider_package_id,
            now,
            now
        ],
    )?;

    Ok(CatalogItem {
        id,
        name: input.name.clone(),
        region: input.region.clone(),
        data_amount: input.data_amount,
        data_unit: input.data_unit.clone(),
        validity_days: input.validity_days,
        prices: input.prices.clone(),
        provider_package_id: input.provider_package_id.clone(),
        created_at: now,
        updated_at: now,
    })
}

pub fn get_catalog_item_by_id(conn: &Connection, id: &str) -> Result<Option<CatalogItem>> {
    query_one(
        conn,
        &format!("SELECT {} FROM catalog_items WHERE id = ?1", CATALOG_ITEM_COLS),
        &[&id],
    )
}

pub fn count_catalog_items(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM catalog_items", [], |row| row.get(0))?;
    Ok(count)
}

// ============ Orders ============

/// Atomically claim a payment session by inserting its order row.
///
/// The unique index on payment_session_id makes this the idempotency gate
/// for webhook processing: the first delivery inserts and wins, any retry
/// or concurrent duplicate affects zero rows and gets `None` back.
pub fn try_claim_order(conn: &Connection, input: &ClaimOrder) -> Result<Option<OrderRecord>> {
    let id = gen_id();
    let now = now();

    let affected = conn.execute(
        "INSERT INTO orders (id, payment_session_id, catalog_item_id, email, customer_name, amount_cents, currency, fulfillment_status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(payment_session_id) DO NOTHING",
        params![
            &id,
            &input.payment_session_id,
            &input.catalog_item_id,
            &input.email,
            &input.customer_name,
            input.amount_cents,
            &input.currency,
            FulfillmentStatus::PendingProvisioning.as_str(),
            now,
            now
        ],
    )?;

    if affected == 0 {
        return Ok(None);
    }

    Ok(Some(OrderRecord {
        id,
        payment_session_id: input.payment_session_id.clone(),
        catalog_item_id: input.catalog_item_id.clone(),
        email: input.email.clone(),
        customer_name: input.customer_name.clone(),
        amount_cents: input.amount_cents,
        currency: input.currency.clone(),
        fulfillment_status: FulfillmentStatus::PendingProvisioning,
        upstream_order_id: None,
        activation_status: None,
        sim_iccid: None,
        qr_code_url: None,
        direct_install_url: None,
        data_balance: None,
        provision_attempts: 0,
        last_error: None,
        notified_at: None,
        created_at: now,
        updated_at: now,
    }))
}

pub fn get_order_by_id(conn: &Connection, id: &str) -> Result<Option<OrderRecord>> {
    query_one(
        conn,
        &format!("SELECT {} FROM orders WHERE id = ?1", ORDER_COLS),
        &[&id],
    )
}

pub fn get_order_by_session(conn: &Connection, session_id: &str) -> Result<Option<OrderRecord>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM orders WHERE payment_session_id = ?1",
            ORDER_COLS
        ),
        &[&session_id],
    )
}

/// Persist a successful provisioning result and advance the state machine.
/// Guarded on the current status so a stale retry cannot clobber a row that
/// already moved past provisioning.
pub fn mark_order_provisioned(
    conn: &Connection,
    order_id: &str,
    result: &ProvisioningOrder,
) -> Result<bool> {
    let sim = result.first_sim();
    let affected = conn.execute(
        "UPDATE orders SET
            fulfillment_status = 'provisioned',
            upstream_order_id = ?2,
            activation_status = ?3,
            sim_iccid = ?4,
            qr_code_url = ?5,
            direct_install_url = ?6,
            data_balance = ?7,
            last_error = NULL,
            updated_at = ?8
         WHERE id = ?1
           AND fulfillment_status IN ('pending_provisioning', 'failed_provisioning')",
        params![
            order_id,
            &result.id,
            &result.status,
            sim.and_then(|s| s.iccid.as_deref()),
            sim.and_then(|s| s.qrcode_url.as_deref()),
            sim.and_then(|s| s.direct_apple_installation_url.as_deref()),
            &result.data_balance,
            now()
        ],
    )?;
    Ok(affected > 0)
}

/// Record a provisioning failure. Returns the new attempt count, or None if
/// the order was not in a provisionable state.
pub fn mark_provision_failed(
    conn: &Connection,
    order_id: &str,
    error: &str,
) -> Result<Option<i64>> {
    conn.query_row(
        "UPDATE orders SET
            fulfillment_status = 'failed_provisioning',
            provision_attempts = provision_attempts + 1,
            last_error = ?2,
            updated_at = ?3
         WHERE id = ?1
           AND fulfillment_status IN ('pending_provisioning', 'failed_provisioning')
         RETURNING provision_attempts",
        params![order_id, error, now()],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

/// Atomically claim the notification step: `provisioned -> notified`.
///
/// Only the caller that flips the row dispatches the email, so concurrent
/// success-page polls cannot double-send. The claim also requires the
/// activation artifact and a destination address to be present.
pub fn try_claim_notification(conn: &Connection, order_id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE orders SET
            fulfillment_status = 'notified',
            notified_at = ?2,
            updated_at = ?2
         WHERE id = ?1
           AND fulfillment_status = 'provisioned'
           AND qr_code_url IS NOT NULL
           AND email IS NOT NULL",
        params![order_id, now()],
    )?;
    Ok(affected > 0)
}

/// Demote a claimed-but-failed notification so the resend affordance applies.
pub fn mark_notification_failed(conn: &Connection, order_id: &str, error: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE orders SET
            fulfillment_status = 'failed_notification',
            notified_at = NULL,
            last_error = ?2,
            updated_at = ?3
         WHERE id = ?1
           AND fulfillment_status IN ('notified', 'failed_notification')",
        params![order_id, error, now()],
    )?;
    Ok(affected > 0)
}

/// Mark a successful (re)send from the resend path.
pub fn mark_notified(conn: &Connection, order_id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE orders SET
            fulfillment_status = 'notified',
            notified_at = ?2,
            last_error = NULL,
            updated_at = ?2
         WHERE id = ?1
           AND fulfillment_status IN ('notified', 'failed_notification')",
        params![order_id, now()],
    )?;
    Ok(affected > 0)
}

/// Orders with a recorded provisioning failure below the attempt cap.
/// The reconciler applies the per-attempt backoff before retrying.
pub fn list_failed_provisioning(conn: &Connection, max_attempts: i64) -> Result<Vec<OrderRecord>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM orders
             WHERE fulfillment_status = 'failed_provisioning' AND provision_attempts < ?1
             ORDER BY updated_at ASC",
            ORDER_COLS
        ),
        &[&max_attempts],
    )
}

/// Orders still pending whose handler likely died before provisioning
/// (crash recovery). `cutoff` is the newest updated_at considered stale.
pub fn list_stale_pending(conn: &Connection, cutoff: i64) -> Result<Vec<OrderRecord>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM orders
             WHERE fulfillment_status = 'pending_provisioning' AND updated_at <= ?1
             ORDER BY updated_at ASC",
            ORDER_COLS
        ),
        &[&cutoff],
    )
}
