use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A purchasable data-plan definition shown in the storefront.
/// Owned by the catalog sync process; read-only from the fulfillment flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,
    /// Destination the plan covers (e.g., "Japan"). Used in confirmation emails.
    pub region: Option<String>,
    pub data_amount: i64,
    pub data_unit: String,
    pub validity_days: i64,
    /// Lowercase currency code -> unit amount in cents
    pub prices: HashMap<String, i64>,
    /// Product identifier on the upstream provisioning service
    pub provider_package_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CatalogItem {
    /// Price in cents for the given currency code (case-insensitive).
    pub fn price_cents(&self, currency: &str) -> Option<i64> {
        self.prices.get(&currency.to_lowercase()).copied()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateCatalogItem {
    pub name: String,
    #[serde(default)]
    pub region: Option<String>,
    pub data_amount: i64,
    pub data_unit: String,
    pub validity_days: i64,
    pub prices: HashMap<String, i64>,
    pub provider_package_id: String,
}
