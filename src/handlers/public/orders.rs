use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;

use crate::db::{AppState, queries};
use crate::error::{AppError, Result};
use crate::fulfillment;
use crate::models::{FulfillmentStatus, OrderRecord};

/// What the success page sees while polling for fulfillment progress.
#[derive(Debug, Serialize)]
pub struct OrderStatusResponse {
    pub payment_session_id: String,
    pub fulfillment_status: FulfillmentStatus,
    pub email: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub upstream_order_id: Option<String>,
    pub activation_status: Option<String>,
    pub sim_iccid: Option<String>,
    pub qr_code_url: Option<String>,
    pub direct_install_url: Option<String>,
    pub data_balance: Option<String>,
    pub notified_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<OrderRecord> for OrderStatusResponse {
    fn from(order: OrderRecord) -> Self {
        // Only notification failures are the customer's business; upstream
        // provisioning errors stay in the logs.
        let last_error = match order.fulfillment_status {
            FulfillmentStatus::FailedNotification => order.last_error,
            _ => None,
        };
        Self {
            payment_session_id: order.payment_session_id,
            fulfillment_status: order.fulfillment_status,
            email: order.email,
            amount_cents: order.amount_cents,
            currency: order.currency,
            upstream_order_id: order.upstream_order_id,
            activation_status: order.activation_status,
            sim_iccid: order.sim_iccid,
            qr_code_url: order.qr_code_url,
            direct_install_url: order.direct_install_url,
            data_balance: order.data_balance,
            notified_at: order.notified_at,
            last_error,
        }
    }
}

/// Fulfillment progress for one payment session, polled by the success page.
///
/// A poll that observes a provisioned order with a visible activation
/// artifact triggers the confirmation email. The dispatch claims the order
/// atomically, so concurrent polls cannot double-send.
pub async fn get_order_status(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<Json<OrderStatusResponse>> {
    let order = {
        let conn = state.db.get()?;
        queries::get_order_by_session(&conn, &session)?
            .ok_or_else(|| AppError::NotFound("Order not found".into()))?
    };

    if order.notifiable() {
        fulfillment::spawn_notification(state.clone(), order.id.clone());
    }

    Ok(Json(order.into()))
}

#[derive(Debug, Serialize)]
pub struct ResendResponse {
    pub sent: bool,
}

/// Manual resend of the confirmation email after a failed send.
pub async fn resend_email(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<Json<ResendResponse>> {
    let order = {
        let conn = state.db.get()?;
        queries::get_order_by_session(&conn, &session)?
            .ok_or_else(|| AppError::NotFound("Order not found".into()))?
    };

    fulfillment::resend_confirmation(&state, &order).await?;

    Ok(Json(ResendResponse { sent: true }))
}
