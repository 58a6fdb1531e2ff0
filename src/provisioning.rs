//! Client for the upstream eSIM provisioning API.
//!
//! Handles the client-credentials token exchange (with a time-boxed cache)
//! and order creation. All failures carry the upstream status and body text
//! for diagnostics; the caller decides whether to retry.

use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{AppError, Result};

/// Tokens are treated as expired this many seconds before their reported
/// lifetime, so an in-flight request cannot race the real expiry.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct CachedToken {
    bearer: String,
    expires_at_ms: i64,
}

impl CachedToken {
    fn from_grant(bearer: String, expires_in_secs: i64, now_ms: i64) -> Self {
        Self {
            bearer,
            expires_at_ms: now_ms + (expires_in_secs - TOKEN_EXPIRY_MARGIN_SECS) * 1000,
        }
    }

    fn valid_at(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms
    }
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[allow(dead_code)]
    token_type: Option<String>,
    expires_in: i64,
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    package_id: &'a str,
    email: &'a str,
    first_name: &'a str,
    last_name: &'a str,
}

/// Upstream order responses arrive wrapped in a `data` envelope.
#[derive(Debug, Deserialize)]
struct OrderEnvelope {
    data: ProvisioningOrder,
}

/// Parsed result of a provisioning "create order" call.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningOrder {
    pub id: String,
    pub status: Option<String>,
    pub activated_at: Option<String>,
    pub expires_at: Option<String>,
    pub data_balance: Option<String>,
    /// Zero instances is not an error: some products activate asynchronously
    /// and deliver the artifact on a later status refresh.
    #[serde(default)]
    pub sims: Vec<SimInstance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimInstance {
    pub iccid: Option<String>,
    pub qrcode_url: Option<String>,
    pub direct_apple_installation_url: Option<String>,
}

impl ProvisioningOrder {
    pub fn first_sim(&self) -> Option<&SimInstance> {
        self.sims.first()
    }
}

pub struct ProvisioningClient {
    http: Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    /// Cached bearer token. The mutex also serializes refreshes so
    /// concurrent callers do not each perform a credential exchange.
    token: Mutex<Option<CachedToken>>,
}

impl ProvisioningClient {
    pub fn new(base_url: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            token: Mutex::new(None),
        }
    }

    /// Reuse the cached bearer token, or perform a credential exchange.
    async fn get_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        let now_ms = Utc::now().timestamp_millis();

        if let Some(cached) = guard.as_ref() {
            if cached.valid_at(now_ms) {
                return Ok(cached.bearer.clone());
            }
        }

        tracing::debug!("Provisioning token missing or expired, exchanging credentials");

        let response = self
            .http
            .post(format!("{}/token", self.base_url))
            .json(&TokenRequest {
                client_id: &self.client_id,
                client_secret: &self.client_secret,
            })
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("Token exchange failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "Token exchange failed: {} - {}",
                status, body
            )));
        }

        let grant: TokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("Invalid token response: {}", e)))?;

        let cached = CachedToken::from_grant(grant.access_token, grant.expires_in, now_ms);
        let bearer = cached.bearer.clone();
        *guard = Some(cached);

        Ok(bearer)
    }

    /// Create a data-plan order upstream.
    pub async fn create_order(
        &self,
        package_id: &str,
        email: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<ProvisioningOrder> {
        let token = self.get_token().await?;

        let response = self
            .http
            .post(format!("{}/orders", self.base_url))
            .bearer_auth(&token)
            .json(&CreateOrderRequest {
                package_id,
                email,
                first_name,
                last_name,
            })
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("Provisioning order failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "Provisioning order failed: {} - {}",
                status, body
            )));
        }

        let envelope: OrderEnvelope = response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("Invalid provisioning response: {}", e)))?;

        tracing::info!(
            upstream_order_id = %envelope.data.id,
            package_id,
            "Provisioning order created"
        );

        Ok(envelope.data)
    }
}
