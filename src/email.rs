//! Confirmation email service.
//!
//! Sends the activation artifact (QR code, direct-install link) to the
//! customer via the Resend API once an order is provisioned. Transient
//! failures are retried with exponential backoff; without an API key the
//! service logs and skips (useful in dev).

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Retry delays in seconds (exponential backoff: 1s, 4s, 16s)
const RETRY_DELAYS: &[u64] = &[1, 4, 16];

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Result of attempting to send a confirmation email.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailSendResult {
    /// Email was sent successfully via Resend
    Sent,
    /// No API key configured, send skipped
    Disabled,
}

/// Everything the confirmation template needs, resolved by the caller.
pub struct OrderConfirmation<'a> {
    pub to_email: &'a str,
    pub customer_name: &'a str,
    pub package_name: &'a str,
    /// Destination the plan covers; falls back to the package name
    pub region: Option<&'a str>,
    pub data_amount: i64,
    pub data_unit: &'a str,
    pub validity_days: i64,
    pub qr_code_url: &'a str,
    pub direct_install_url: Option<&'a str>,
}

/// Resend API request body.
#[derive(Debug, Serialize)]
struct ResendEmailRequest<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: String,
    text: String,
    html: String,
}

/// Resend API response.
#[derive(Debug, Deserialize)]
struct ResendEmailResponse {
    #[allow(dead_code)]
    id: String,
}

#[derive(Clone)]
pub struct EmailService {
    api_key: Option<String>,
    from_email: String,
    api_url: String,
    http_client: Client,
}

impl EmailService {
    pub fn new(api_key: Option<String>, from_email: String) -> Self {
        Self {
            api_key,
            from_email,
            api_url: RESEND_API_URL.to_string(),
            http_client: Client::new(),
        }
    }

    /// Point the service at a different API endpoint. Used by tests to
    /// capture sends against a local stub.
    pub fn with_api_url(mut self, api_url: &str) -> Self {
        self.api_url = api_url.to_string();
        self
    }

    /// Send the order confirmation email with the activation artifact.
    pub async fn send_order_confirmation(
        &self,
        confirmation: OrderConfirmation<'_>,
    ) -> Result<EmailSendResult> {
        let Some(api_key) = self.api_key.as_deref() else {
            tracing::warn!(
                to = %confirmation.to_email,
                "No Resend API key configured, skipping confirmation email"
            );
            return Ok(EmailSendResult::Disabled);
        };

        let destination = confirmation.region.unwrap_or(confirmation.package_name);
        let subject = format!("Your eSIM for {} is ready", destination);
        let (text, html) = build_bodies(&confirmation);

        let request = ResendEmailRequest {
            from: &self.from_email,
            to: vec![confirmation.to_email],
            subject,
            text,
            html,
        };

        self.send_request_with_retry(api_key, &request, confirmation.to_email)
            .await
    }

    /// Send a request to Resend with exponential backoff retry.
    ///
    /// Retries on transient errors (network issues, 5xx, 429 rate limit).
    /// Fails immediately on non-transient errors (4xx except 429).
    async fn send_request_with_retry(
        &self,
        api_key: &str,
        request: &ResendEmailRequest<'_>,
        to_email: &str,
    ) -> Result<EmailSendResult> {
        let mut last_error: Option<AppError> = None;

        for (attempt, delay_secs) in std::iter::once(&0u64).chain(RETRY_DELAYS).enumerate() {
            if *delay_secs > 0 {
                tracing::warn!(
                    attempt,
                    delay_secs,
                    "Retrying email send after transient failure"
                );
                tokio::time::sleep(Duration::from_secs(*delay_secs)).await;
            }

            match self.send_resend_request(api_key, request).await {
                Ok(()) => {
                    if attempt > 0 {
                        tracing::info!(attempt, to = %to_email, "Email sent successfully after retry");
                    } else {
                        tracing::info!(to = %to_email, "Confirmation email sent via Resend");
                    }
                    return Ok(EmailSendResult::Sent);
                }
                Err((error, is_transient)) => {
                    if is_transient {
                        last_error = Some(error);
                    } else {
                        return Err(error);
                    }
                }
            }
        }

        tracing::error!(
            to = %to_email,
            attempts = RETRY_DELAYS.len() + 1,
            "Email send failed after all retries"
        );
        Err(last_error.unwrap_or_else(|| {
            AppError::Internal("Email service error: all retries exhausted".into())
        }))
    }

    /// Send a single request to Resend.
    ///
    /// Returns Ok(()) on success, or Err((AppError, is_transient)) on failure.
    async fn send_resend_request(
        &self,
        api_key: &str,
        request: &ResendEmailRequest<'_>,
    ) -> std::result::Result<(), (AppError, bool)> {
        let response = self
            .http_client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to send request to Resend API");
                // Network errors are transient
                (
                    AppError::Internal(format!("Email service error: {}", e)),
                    true,
                )
            })?;

        let status = response.status();

        if status.is_success() {
            let _result: ResendEmailResponse = response.json().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to parse Resend API response");
                (AppError::Internal("Email service response error".into()), false)
            })?;
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();

            let is_transient = status.as_u16() == 429 || status.is_server_error();

            if is_transient {
                tracing::warn!(status = %status, body = %body, "Resend API returned transient error");
            } else {
                tracing::error!(status = %status, body = %body, "Resend API returned non-transient error");
            }

            Err((
                AppError::Internal(format!("Email service error: {} - {}", status, body)),
                is_transient,
            ))
        }
    }
}

/// Build the plain-text and HTML bodies for a confirmation email.
fn build_bodies(c: &OrderConfirmation<'_>) -> (String, String) {
    let destination = c.region.unwrap_or(c.package_name);

    let install_line_text = match c.direct_install_url {
        Some(url) => format!("\nOn iOS you can also install directly: {}\n", url),
        None => String::new(),
    };
    let text = format!(
        "Hello {},\n\nYour eSIM for {} is ready!\n\nDetails:\n- Package: {}\n- Data: {} {}\n- Validity: {} days\n\nTo install your eSIM, scan the QR code in the HTML version of this email.\n{}\nSafe travels!\n",
        c.customer_name,
        destination,
        c.package_name,
        c.data_amount,
        c.data_unit,
        c.validity_days,
        install_line_text
    );

    let install_block_html = match c.direct_install_url {
        Some(url) => format!(
            r#"<p>On iOS you can also <a href="{}">install directly</a>.</p>"#,
            url
        ),
        None => String::new(),
    };
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 600px; margin: 0 auto; padding: 20px;">
<h2 style="color: #333;">Your eSIM for {} is ready</h2>
<p>Hello {},</p>
<p>Scan this QR code from another device to install your eSIM:</p>
<div style="background: #f5f5f5; padding: 20px; border-radius: 8px; text-align: center;">
<img src="{}" alt="eSIM activation QR code" style="max-width: 240px;">
</div>
{}
<p><strong>{}</strong> &mdash; {} {} for {} days</p>
<hr style="border: none; border-top: 1px solid #eee; margin: 30px 0;">
<p style="color: #999; font-size: 12px;">Need help? Reply to this email and our team will assist you.</p>
</body>
</html>"#,
        destination,
        c.customer_name,
        c.qr_code_url,
        install_block_html,
        c.package_name,
        c.data_amount,
        c.data_unit,
        c.validity_days
    );

    (text, html)
}
