use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};

use crate::db::{AppState, queries};
use crate::error::{AppError, Result};

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    /// Catalog item to purchase
    pub package_id: String,
    /// Currency code, defaults to "eur"
    #[serde(default)]
    pub currency: Option<String>,
    /// Known customer email, passed through to the payment processor
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub checkout_url: String,
    pub session_id: String,
}

/// Create a payment-processor checkout session for one catalog item.
///
/// The session carries `metadata[package_id]`, which is how the webhook
/// later resolves the paid event back to this item.
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>> {
    let item = {
        let conn = state.db.get()?;
        queries::get_catalog_item_by_id(&conn, &request.package_id)?
            .ok_or_else(|| AppError::NotFound("Catalog item not found".into()))?
    };

    let currency = request
        .currency
        .as_deref()
        .map(|c| c.to_lowercase())
        .unwrap_or_else(|| "eur".to_string());
    let unit_amount = item.price_cents(&currency).ok_or_else(|| {
        AppError::BadRequest(format!("No price configured for currency: {}", currency))
    })?;

    // Stripe substitutes the session id into the literal template below,
    // which is what the success page polls /orders/{session} with.
    let success_url = format!(
        "{}/success?session={{CHECKOUT_SESSION_ID}}",
        state.base_url
    );
    let cancel_url = format!("{}/cancel", state.base_url);

    let (session_id, checkout_url) = state
        .stripe
        .create_checkout_session(
            &item.id,
            &item.name,
            &currency,
            unit_amount,
            request.email.as_deref(),
            &success_url,
            &cancel_url,
        )
        .await?;

    tracing::info!(
        session = %session_id,
        package_id = %item.id,
        %currency,
        "Checkout session created"
    );

    Ok(Json(CheckoutResponse {
        checkout_url,
        session_id,
    }))
}
