mod from_row;
mod schema;
pub mod queries;

pub use schema::init_db;

use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::email::EmailService;
use crate::payments::StripeClient;
use crate::provisioning::ProvisioningClient;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Application state shared by all handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    /// Storefront base URL for success/cancel redirect links
    pub base_url: String,
    pub stripe: StripeClient,
    pub provisioning: Arc<ProvisioningClient>,
    pub email: Arc<EmailService>,
}

pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    let manager = SqliteConnectionManager::file(database_path);
    Pool::builder().max_size(10).build(manager)
}
