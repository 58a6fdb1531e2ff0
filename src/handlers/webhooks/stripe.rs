//! Stripe payment webhook receiver.
//!
//! The handler does as little as possible synchronously: verify the
//! signature, filter the event, durably claim the order row, spawn the
//! provisioning task, acknowledge. Remote work never runs inside the
//! webhook request, so the processor's delivery timeout cannot trigger
//! retry storms against a slow upstream.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};

use crate::db::{AppState, queries};
use crate::fulfillment;
use crate::models::ClaimOrder;
use crate::payments::{StripeCheckoutSession, StripeWebhookEvent};

/// Result type for webhook operations.
pub type WebhookResult = (StatusCode, &'static str);

fn extract_signature(headers: &HeaderMap) -> Result<String, WebhookResult> {
    headers
        .get("stripe-signature")
        .ok_or((StatusCode::BAD_REQUEST, "Missing stripe-signature header"))?
        .to_str()
        .map(|s| s.to_string())
        .map_err(|e| {
            tracing::debug!("Invalid UTF-8 in Stripe signature header: {}", e);
            (StatusCode::BAD_REQUEST, "Invalid signature header")
        })
}

/// Axum handler for Stripe webhooks.
pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = match extract_signature(&headers) {
        Ok(s) => s,
        Err(e) => return e,
    };

    // Fail closed on anything short of a verified signature. No parsing,
    // no side effects.
    match state.stripe.verify_webhook_signature(&body, &signature) {
        Ok(true) => {}
        Ok(false) => return (StatusCode::BAD_REQUEST, "Invalid signature"),
        Err(e) => {
            tracing::debug!("Signature verification error: {}", e);
            return (StatusCode::BAD_REQUEST, "Invalid signature");
        }
    }

    let event: StripeWebhookEvent = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("Failed to parse Stripe webhook: {}", e);
            return (StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };

    if event.event_type != "checkout.session.completed" {
        return (StatusCode::OK, "Event ignored");
    }

    let session: StripeCheckoutSession = match serde_json::from_value(event.data.object) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to parse checkout session: {}", e);
            return (StatusCode::BAD_REQUEST, "Invalid checkout session");
        }
    };

    if session.payment_status != "paid" {
        return (StatusCode::OK, "Event ignored");
    }

    process_paid_session(&state, session).unwrap_or_else(|e| e)
}

/// Claim the order for a paid checkout session and kick off provisioning.
fn process_paid_session(
    state: &AppState,
    session: StripeCheckoutSession,
) -> Result<WebhookResult, WebhookResult> {
    // The catalog item reference is the one piece of metadata fulfillment
    // cannot proceed without. Its absence is a lost sale: acknowledge so
    // the processor stops retrying, and leave a loud log trail.
    let Some(package_id) = session.metadata.package_id.clone() else {
        tracing::error!(
            session = %session.id,
            "Paid checkout session has no package_id in metadata, order lost"
        );
        return Ok((StatusCode::OK, "Missing package reference"));
    };

    let conn = state.db.get().map_err(|e| {
        tracing::error!("DB connection error: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Database error")
    })?;

    let item = match queries::get_catalog_item_by_id(&conn, &package_id) {
        Ok(Some(item)) => item,
        Ok(None) => {
            tracing::error!(
                session = %session.id,
                package_id = %package_id,
                "Paid checkout session references unknown catalog item"
            );
            return Ok((StatusCode::OK, "Unknown catalog item"));
        }
        Err(e) => {
            tracing::error!("DB error: {}", e);
            return Err((StatusCode::INTERNAL_SERVER_ERROR, "Database error"));
        }
    };

    let email = session.customer_email();
    if email.is_none() {
        tracing::warn!(
            session = %session.id,
            "Paid checkout session has no customer email, confirmation will be skipped"
        );
    }

    let currency = session
        .currency
        .as_deref()
        .map(|c| c.to_lowercase())
        .unwrap_or_else(|| "eur".to_string());
    let amount_cents = session
        .amount_total
        .or_else(|| item.price_cents(&currency))
        .unwrap_or_default();

    let claim = ClaimOrder {
        payment_session_id: session.id.clone(),
        catalog_item_id: item.id.clone(),
        email,
        customer_name: Some(session.customer_name()),
        amount_cents,
        currency,
    };

    // The claim insert is the idempotency gate. A database failure here is
    // the one case worth a 5xx: we could not durably accept the delivery,
    // so the processor should retry it.
    let order = match queries::try_claim_order(&conn, &claim) {
        Ok(Some(order)) => order,
        Ok(None) => {
            tracing::info!(session = %session.id, "Duplicate webhook delivery, order already claimed");
            return Ok((StatusCode::OK, "Already processed"));
        }
        Err(e) => {
            tracing::error!("Failed to claim order: {}", e);
            return Err((StatusCode::INTERNAL_SERVER_ERROR, "Database error"));
        }
    };

    tracing::info!(
        order_id = %order.id,
        session = %session.id,
        package_id = %package_id,
        "Checkout completed, order claimed"
    );

    fulfillment::spawn_provisioning(state.clone(), order.id);

    Ok((StatusCode::OK, "OK"))
}
