use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    /// Storefront base URL, used to build checkout success/cancel links
    pub base_url: String,
    pub provisioning_api_url: String,
    pub provisioning_client_id: String,
    pub provisioning_client_secret: String,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub resend_api_key: Option<String>,
    pub email_from: String,
    pub dev_mode: bool,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let dev_mode = env::var("NOMADSIM_ENV")
            .map(|v| v == "dev" || v == "development")
            .unwrap_or(false);

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        let base_url =
            env::var("BASE_URL").unwrap_or_else(|_| format!("http://{}:{}", host, port));

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "nomadsim.db".to_string()),
            base_url,
            provisioning_api_url: env::var("PROVISIONING_API_URL")
                .unwrap_or_else(|_| "https://sandbox-partners-api.airalo.com/api/v2".to_string()),
            provisioning_client_id: env::var("PROVISIONING_CLIENT_ID").unwrap_or_default(),
            provisioning_client_secret: env::var("PROVISIONING_CLIENT_SECRET").unwrap_or_default(),
            stripe_secret_key: env::var("STRIPE_SECRET_KEY").unwrap_or_default(),
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
            resend_api_key: env::var("RESEND_API_KEY").ok(),
            email_from: env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "NomadSIM <orders@nomadsim.example>".to_string()),
            dev_mode,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
