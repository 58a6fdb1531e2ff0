use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nomadsim::config::Config;
use nomadsim::db::{AppState, create_pool, init_db, queries};
use nomadsim::email::EmailService;
use nomadsim::fulfillment;
use nomadsim::handlers;
use nomadsim::models::CreateCatalogItem;
use nomadsim::payments::StripeClient;
use nomadsim::provisioning::ProvisioningClient;

#[derive(Parser, Debug)]
#[command(name = "nomadsim")]
#[command(about = "Order fulfillment service for a travel eSIM storefront")]
struct Cli {
    /// Seed the database with a sample catalog item (dev mode only)
    #[arg(long)]
    seed: bool,

    /// Delete the database on exit (dev mode only, useful for fresh starts)
    #[arg(long)]
    ephemeral: bool,
}

/// Seeds the catalog with a sample data plan for local testing.
/// Only runs in dev mode and when the catalog is empty.
fn seed_dev_data(state: &AppState) {
    let conn = state.db.get().expect("Failed to get db connection for seeding");

    let count = queries::count_catalog_items(&conn).expect("Failed to count catalog items");
    if count > 0 {
        tracing::info!("Catalog already has data, skipping seed");
        return;
    }

    let item = queries::create_catalog_item(
        &conn,
        &CreateCatalogItem {
            name: "Japan 3GB".to_string(),
            region: Some("Japan".to_string()),
            data_amount: 3,
            data_unit: "GB".to_string(),
            validity_days: 30,
            prices: HashMap::from([("eur".to_string(), 1250), ("usd".to_string(), 1390)]),
            provider_package_id: "japan-3gb-30days".to_string(),
        },
    )
    .expect("Failed to create dev catalog item");

    tracing::info!("============================================");
    tracing::info!("DEV CATALOG ITEM SEEDED");
    tracing::info!("Name: {}", item.name);
    tracing::info!("Catalog ID: {}", item.id);
    tracing::info!("Provider package: {}", item.provider_package_id);
    tracing::info!("============================================");
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nomadsim=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    if config.dev_mode {
        tracing::info!("Running in DEVELOPMENT mode");
    }

    let db_pool = create_pool(&config.database_path).expect("Failed to create database pool");
    {
        let conn = db_pool.get().expect("Failed to get connection");
        init_db(&conn).expect("Failed to initialize database");
    }

    let state = AppState {
        db: db_pool,
        base_url: config.base_url.clone(),
        stripe: StripeClient::new(&config.stripe_secret_key, &config.stripe_webhook_secret),
        provisioning: Arc::new(ProvisioningClient::new(
            &config.provisioning_api_url,
            &config.provisioning_client_id,
            &config.provisioning_client_secret,
        )),
        email: Arc::new(EmailService::new(
            config.resend_api_key.clone(),
            config.email_from.clone(),
        )),
    };

    // Seed dev data if --seed flag is passed (only in dev mode)
    if cli.seed {
        if !config.dev_mode {
            tracing::warn!("--seed flag ignored: not in dev mode (set NOMADSIM_ENV=dev)");
        } else {
            seed_dev_data(&state);
        }
    }

    // Resume orders stuck mid-fulfillment (failed or orphaned by a crash)
    fulfillment::spawn_reconciler(state.clone());

    let app = Router::new()
        .merge(handlers::public::router())
        .merge(handlers::webhooks::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    let cleanup_on_exit = cli.ephemeral && config.dev_mode;
    let db_path = config.database_path.clone();

    if cleanup_on_exit {
        tracing::info!("EPHEMERAL MODE: database will be deleted on exit");
    }

    tracing::info!("NomadSIM server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to start server");

    if cleanup_on_exit {
        tracing::info!("Cleaning up ephemeral database...");
        if let Err(e) = std::fs::remove_file(&db_path) {
            tracing::warn!("Failed to remove {}: {}", db_path, e);
        } else {
            tracing::info!("Removed {}", db_path);
        }
        let _ = std::fs::remove_file(format!("{}-wal", db_path));
        let _ = std::fs::remove_file(format!("{}-shm", db_path));
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutdown signal received, stopping server...");
}
