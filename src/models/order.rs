use serde::{Deserialize, Serialize};

/// Per-order fulfillment state machine.
///
/// Forward path: `pending_provisioning -> provisioned -> notified`.
/// `failed_provisioning` and `failed_notification` are retryable; the
/// background reconciler resumes the former, the resend endpoint the latter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    PendingProvisioning,
    Provisioned,
    Notified,
    FailedProvisioning,
    FailedNotification,
}

impl FulfillmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FulfillmentStatus::PendingProvisioning => "pending_provisioning",
            FulfillmentStatus::Provisioned => "provisioned",
            FulfillmentStatus::Notified => "notified",
            FulfillmentStatus::FailedProvisioning => "failed_provisioning",
            FulfillmentStatus::FailedNotification => "failed_notification",
        }
    }
}

impl std::fmt::Display for FulfillmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FulfillmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_provisioning" => Ok(FulfillmentStatus::PendingProvisioning),
            "provisioned" => Ok(FulfillmentStatus::Provisioned),
            "notified" => Ok(FulfillmentStatus::Notified),
            "failed_provisioning" => Ok(FulfillmentStatus::FailedProvisioning),
            "failed_notification" => Ok(FulfillmentStatus::FailedNotification),
            _ => Err(format!("Invalid fulfillment status: {}", s)),
        }
    }
}

/// The durable record tying a payment session to a provisioning result.
/// At most one row exists per payment session (unique index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    pub payment_session_id: String,
    pub catalog_item_id: String,
    /// Customer email from the payment processor. May be absent; provisioning
    /// then uses a placeholder address and notification is skipped.
    pub email: Option<String>,
    pub customer_name: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub fulfillment_status: FulfillmentStatus,
    pub upstream_order_id: Option<String>,
    pub activation_status: Option<String>,
    pub sim_iccid: Option<String>,
    pub qr_code_url: Option<String>,
    pub direct_install_url: Option<String>,
    pub data_balance: Option<String>,
    pub provision_attempts: i64,
    pub last_error: Option<String>,
    pub notified_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OrderRecord {
    /// Whether the activation artifact is visible and deliverable by email.
    pub fn notifiable(&self) -> bool {
        self.fulfillment_status == FulfillmentStatus::Provisioned
            && self.qr_code_url.is_some()
            && self.email.is_some()
    }
}

/// Input for the idempotency-claim insert performed by the webhook handler.
#[derive(Debug)]
pub struct ClaimOrder {
    pub payment_session_id: String,
    pub catalog_item_id: String,
    pub email: Option<String>,
    pub customer_name: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
}
