//! Test utilities and fixtures for NomadSIM integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use serde_json::json;
use tokio::sync::Mutex;
use tower::ServiceExt;

pub use nomadsim::db::{AppState, DbPool, init_db, queries};
pub use nomadsim::email::EmailService;
pub use nomadsim::handlers;
pub use nomadsim::models::*;
pub use nomadsim::payments::StripeClient;
pub use nomadsim::provisioning::ProvisioningClient;

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Create a pooled shared-memory test database with schema initialized.
/// Each call gets its own database; the pool's idle connections keep it alive.
pub fn setup_test_pool() -> DbPool {
    let uri = format!(
        "file:testdb-{}?mode=memory&cache=shared",
        uuid::Uuid::new_v4()
    );
    let manager = SqliteConnectionManager::file(uri);
    let pool = Pool::builder().max_size(4).build(manager).unwrap();
    {
        let conn = pool.get().unwrap();
        init_db(&conn).unwrap();
    }
    pool
}

/// Create a standalone in-memory database with schema initialized
/// (for direct query-level tests).
pub fn setup_test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("Failed to create in-memory database");
    init_db(&conn).expect("Failed to initialize schema");
    conn
}

/// Create a test catalog item whose upstream product id is "P123".
pub fn create_test_catalog_item(conn: &Connection) -> CatalogItem {
    let input = CreateCatalogItem {
        name: "Japan 3GB".to_string(),
        region: Some("Japan".to_string()),
        data_amount: 3,
        data_unit: "GB".to_string(),
        validity_days: 30,
        prices: HashMap::from([("eur".to_string(), 1250), ("usd".to_string(), 1390)]),
        provider_package_id: "P123".to_string(),
    };
    queries::create_catalog_item(conn, &input).expect("Failed to create test catalog item")
}

// ============ Stub upstream services ============

/// Call counters for the stub provisioning API.
#[derive(Clone, Default)]
pub struct ProvisioningStub {
    pub token_calls: Arc<AtomicUsize>,
    pub order_calls: Arc<AtomicUsize>,
}

/// Spawn an in-process provisioning API stub on an ephemeral port.
///
/// `/token` always succeeds with a one-hour token. `/orders` returns a
/// completed order with one SIM instance, or a 500 when `fail_orders` is set.
pub async fn spawn_provisioning_stub(fail_orders: bool) -> (String, ProvisioningStub) {
    let stub = ProvisioningStub::default();

    let token_stub = stub.clone();
    let order_stub = stub.clone();
    let app = Router::new()
        .route(
            "/token",
            post(move || {
                let stub = token_stub.clone();
                async move {
                    stub.token_calls.fetch_add(1, Ordering::SeqCst);
                    Json(json!({
                        "access_token": "test-token",
                        "token_type": "Bearer",
                        "expires_in": 3600
                    }))
                }
            }),
        )
        .route(
            "/orders",
            post(move || {
                let stub = order_stub.clone();
                async move {
                    stub.order_calls.fetch_add(1, Ordering::SeqCst);
                    if fail_orders {
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            Json(json!({"message": "upstream exploded"})),
                        )
                            .into_response()
                    } else {
                        Json(json!({
                            "data": {
                                "id": "ord_1",
                                "status": "completed",
                                "data_balance": "3 GB",
                                "sims": [{
                                    "iccid": "8901000000000000001",
                                    "qrcode_url": "https://cdn.example/qr.png",
                                    "direct_apple_installation_url": "https://esimsetup.apple.com/install"
                                }]
                            }
                        }))
                        .into_response()
                    }
                }
            }),
        );

    (serve_stub(app).await, stub)
}

/// Captured request bodies from the stub email API.
pub type SentEmails = Arc<Mutex<Vec<serde_json::Value>>>;

/// Spawn an in-process Resend-style email API stub on an ephemeral port.
///
/// Successful sends are captured for assertions. When `fail_sends` is set,
/// the stub returns a 400 (non-transient, so the service fails immediately
/// instead of sleeping through retries).
pub async fn spawn_email_stub(fail_sends: bool) -> (String, SentEmails) {
    let sent: SentEmails = Arc::new(Mutex::new(Vec::new()));

    let captured = sent.clone();
    let app = Router::new().route(
        "/emails",
        post(move |Json(body): Json<serde_json::Value>| {
            let captured = captured.clone();
            async move {
                if fail_sends {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"message": "invalid recipient"})),
                    )
                        .into_response();
                }
                captured.lock().await.push(body);
                Json(json!({"id": "email_1"})).into_response()
            }
        }),
    );

    (serve_stub(app).await, sent)
}

async fn serve_stub(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// ============ Application fixture ============

pub struct TestEnv {
    pub state: AppState,
    pub provisioning: ProvisioningStub,
    pub emails: SentEmails,
}

pub async fn setup_env() -> TestEnv {
    setup_env_with(false, false).await
}

/// Create an AppState wired to fresh stub services and a fresh database.
pub async fn setup_env_with(fail_orders: bool, fail_sends: bool) -> TestEnv {
    let (provisioning_url, provisioning) = spawn_provisioning_stub(fail_orders).await;
    let (email_url, emails) = spawn_email_stub(fail_sends).await;

    let state = AppState {
        db: setup_test_pool(),
        base_url: "http://localhost:3000".to_string(),
        stripe: StripeClient::new("sk_test_xxx", TEST_WEBHOOK_SECRET),
        provisioning: Arc::new(ProvisioningClient::new(
            &provisioning_url,
            "test_client_id",
            "test_client_secret",
        )),
        email: Arc::new(
            EmailService::new(
                Some("re_test_key".to_string()),
                "NomadSIM <orders@nomadsim.example>".to_string(),
            )
            .with_api_url(&format!("{}/emails", email_url)),
        ),
    };

    TestEnv {
        state,
        provisioning,
        emails,
    }
}

/// Create a Router with all endpoints.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(handlers::public::router())
        .merge(handlers::webhooks::router())
        .with_state(state)
}

// ============ Webhook helpers ============

/// Compute a valid Stripe signature header for the given payload.
pub fn stripe_signature(payload: &[u8], secret: &str) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let timestamp = chrono::Utc::now().timestamp().to_string();
    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(signed_payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    format!("t={},v1={}", timestamp, signature)
}

/// Build a checkout.session.completed event body.
pub fn checkout_event(
    session_id: &str,
    package_id: Option<&str>,
    email: Option<&str>,
    payment_status: &str,
) -> String {
    let mut metadata = json!({});
    if let Some(package_id) = package_id {
        metadata["package_id"] = json!(package_id);
    }
    json!({
        "type": "checkout.session.completed",
        "data": {
            "object": {
                "id": session_id,
                "payment_status": payment_status,
                "amount_total": 1250,
                "currency": "eur",
                "customer_details": {
                    "email": email,
                    "name": "Ana Traveler"
                },
                "metadata": metadata
            }
        }
    })
    .to_string()
}

/// POST a body to the webhook endpoint, optionally signed.
pub async fn post_webhook(
    app: &Router,
    body: String,
    signature: Option<String>,
) -> (StatusCode, String) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhook/stripe")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header("stripe-signature", signature);
    }
    let request = builder.body(Body::from(body)).unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8_lossy(&body).to_string())
}

/// GET a path and return status plus parsed JSON body.
pub async fn get_json(app: &Router, path: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, value)
}

/// POST an empty body and return status plus parsed JSON body.
pub async fn post_json(app: &Router, path: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, value)
}

// ============ Async assertions ============

/// Poll until the order for `session` reaches `status` (spawned fulfillment
/// tasks run in the background, so tests wait instead of asserting directly).
pub async fn wait_for_order_status(
    pool: &DbPool,
    session: &str,
    status: FulfillmentStatus,
) -> OrderRecord {
    for _ in 0..200 {
        {
            let conn = pool.get().unwrap();
            if let Some(order) = queries::get_order_by_session(&conn, session).unwrap() {
                if order.fulfillment_status == status {
                    return order;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("Timed out waiting for order {} to reach {}", session, status);
}

/// Poll until the stub email API has captured `count` sends.
pub async fn wait_for_email_count(emails: &SentEmails, count: usize) {
    for _ in 0..200 {
        if emails.lock().await.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("Timed out waiting for {} captured emails", count);
}
