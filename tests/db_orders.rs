//! Query-level tests for the order state machine and catalog storage.

mod common;

use common::*;
use nomadsim::provisioning::ProvisioningOrder;

fn claim_input(item: &CatalogItem, session: &str) -> ClaimOrder {
    ClaimOrder {
        payment_session_id: session.to_string(),
        catalog_item_id: item.id.clone(),
        email: Some("buyer@example.com".to_string()),
        customer_name: Some("Ana Traveler".to_string()),
        amount_cents: 1250,
        currency: "eur".to_string(),
    }
}

fn provisioned_result() -> ProvisioningOrder {
    serde_json::from_str(
        r#"{
            "id": "ord_1",
            "status": "completed",
            "data_balance": "3 GB",
            "sims": [{
                "iccid": "8901000000000000001",
                "qrcode_url": "https://cdn.example/qr.png",
                "direct_apple_installation_url": "https://esimsetup.apple.com/install"
            }]
        }"#,
    )
    .unwrap()
}

#[test]
fn test_catalog_item_round_trip() {
    let conn = setup_test_db();
    let item = create_test_catalog_item(&conn);

    let loaded = queries::get_catalog_item_by_id(&conn, &item.id)
        .unwrap()
        .unwrap();
    assert_eq!(loaded.name, "Japan 3GB");
    assert_eq!(loaded.provider_package_id, "P123");
    assert_eq!(loaded.price_cents("eur"), Some(1250));
    assert_eq!(loaded.price_cents("EUR"), Some(1250));
    assert_eq!(loaded.price_cents("gbp"), None);
}

#[test]
fn test_claim_is_idempotent_per_session() {
    let conn = setup_test_db();
    let item = create_test_catalog_item(&conn);

    let first = queries::try_claim_order(&conn, &claim_input(&item, "cs_1")).unwrap();
    let second = queries::try_claim_order(&conn, &claim_input(&item, "cs_1")).unwrap();
    let other = queries::try_claim_order(&conn, &claim_input(&item, "cs_2")).unwrap();

    assert!(first.is_some());
    assert!(second.is_none(), "Duplicate session must not insert");
    assert!(other.is_some());

    let order = first.unwrap();
    assert_eq!(order.fulfillment_status, FulfillmentStatus::PendingProvisioning);
    assert_eq!(order.provision_attempts, 0);
}

#[test]
fn test_provisioned_transition_persists_artifact() {
    let conn = setup_test_db();
    let item = create_test_catalog_item(&conn);
    let order = queries::try_claim_order(&conn, &claim_input(&item, "cs_1"))
        .unwrap()
        .unwrap();

    assert!(queries::mark_order_provisioned(&conn, &order.id, &provisioned_result()).unwrap());

    let loaded = queries::get_order_by_id(&conn, &order.id).unwrap().unwrap();
    assert_eq!(loaded.fulfillment_status, FulfillmentStatus::Provisioned);
    assert_eq!(loaded.upstream_order_id.as_deref(), Some("ord_1"));
    assert_eq!(loaded.sim_iccid.as_deref(), Some("8901000000000000001"));
    assert_eq!(loaded.qr_code_url.as_deref(), Some("https://cdn.example/qr.png"));
    assert_eq!(
        loaded.direct_install_url.as_deref(),
        Some("https://esimsetup.apple.com/install")
    );
    assert_eq!(loaded.data_balance.as_deref(), Some("3 GB"));
    assert!(loaded.notifiable());

    // A stale retry cannot re-provision a completed order.
    assert!(!queries::mark_order_provisioned(&conn, &order.id, &provisioned_result()).unwrap());
}

#[test]
fn test_provision_failure_counts_attempts() {
    let conn = setup_test_db();
    let item = create_test_catalog_item(&conn);
    let order = queries::try_claim_order(&conn, &claim_input(&item, "cs_1"))
        .unwrap()
        .unwrap();

    let first = queries::mark_provision_failed(&conn, &order.id, "boom").unwrap();
    let second = queries::mark_provision_failed(&conn, &order.id, "boom again").unwrap();

    assert_eq!(first, Some(1));
    assert_eq!(second, Some(2));

    let loaded = queries::get_order_by_id(&conn, &order.id).unwrap().unwrap();
    assert_eq!(loaded.fulfillment_status, FulfillmentStatus::FailedProvisioning);
    assert_eq!(loaded.last_error.as_deref(), Some("boom again"));

    // Success after failures clears the error and advances the state.
    assert!(queries::mark_order_provisioned(&conn, &order.id, &provisioned_result()).unwrap());
    let loaded = queries::get_order_by_id(&conn, &order.id).unwrap().unwrap();
    assert_eq!(loaded.fulfillment_status, FulfillmentStatus::Provisioned);
    assert!(loaded.last_error.is_none());
}

#[test]
fn test_notification_claim_requires_artifact_and_email() {
    let conn = setup_test_db();
    let item = create_test_catalog_item(&conn);

    // Order without email: claim must refuse even when provisioned.
    let mut input = claim_input(&item, "cs_noemail");
    input.email = None;
    let order = queries::try_claim_order(&conn, &input).unwrap().unwrap();
    queries::mark_order_provisioned(&conn, &order.id, &provisioned_result()).unwrap();
    assert!(!queries::try_claim_notification(&conn, &order.id).unwrap());

    // Pending order: no artifact yet, claim must refuse.
    let pending = queries::try_claim_order(&conn, &claim_input(&item, "cs_pending"))
        .unwrap()
        .unwrap();
    assert!(!queries::try_claim_notification(&conn, &pending.id).unwrap());
}

#[test]
fn test_notification_claim_is_single_winner() {
    let conn = setup_test_db();
    let item = create_test_catalog_item(&conn);
    let order = queries::try_claim_order(&conn, &claim_input(&item, "cs_1"))
        .unwrap()
        .unwrap();
    queries::mark_order_provisioned(&conn, &order.id, &provisioned_result()).unwrap();

    assert!(queries::try_claim_notification(&conn, &order.id).unwrap());
    assert!(
        !queries::try_claim_notification(&conn, &order.id).unwrap(),
        "Second claim must lose"
    );

    let loaded = queries::get_order_by_id(&conn, &order.id).unwrap().unwrap();
    assert_eq!(loaded.fulfillment_status, FulfillmentStatus::Notified);
    assert!(loaded.notified_at.is_some());
}

#[test]
fn test_notification_failure_and_resend_cycle() {
    let conn = setup_test_db();
    let item = create_test_catalog_item(&conn);
    let order = queries::try_claim_order(&conn, &claim_input(&item, "cs_1"))
        .unwrap()
        .unwrap();
    queries::mark_order_provisioned(&conn, &order.id, &provisioned_result()).unwrap();
    queries::try_claim_notification(&conn, &order.id).unwrap();

    assert!(queries::mark_notification_failed(&conn, &order.id, "smtp down").unwrap());
    let loaded = queries::get_order_by_id(&conn, &order.id).unwrap().unwrap();
    assert_eq!(loaded.fulfillment_status, FulfillmentStatus::FailedNotification);
    assert!(loaded.notified_at.is_none());
    assert_eq!(loaded.last_error.as_deref(), Some("smtp down"));

    assert!(queries::mark_notified(&conn, &order.id).unwrap());
    let loaded = queries::get_order_by_id(&conn, &order.id).unwrap().unwrap();
    assert_eq!(loaded.fulfillment_status, FulfillmentStatus::Notified);
    assert!(loaded.notified_at.is_some());
    assert!(loaded.last_error.is_none());
}

#[test]
fn test_reconciler_listings() {
    let conn = setup_test_db();
    let item = create_test_catalog_item(&conn);

    let failed = queries::try_claim_order(&conn, &claim_input(&item, "cs_failed"))
        .unwrap()
        .unwrap();
    queries::mark_provision_failed(&conn, &failed.id, "boom").unwrap();

    let capped = queries::try_claim_order(&conn, &claim_input(&item, "cs_capped"))
        .unwrap()
        .unwrap();
    for _ in 0..5 {
        queries::mark_provision_failed(&conn, &capped.id, "boom").unwrap();
    }

    let pending = queries::try_claim_order(&conn, &claim_input(&item, "cs_pending"))
        .unwrap()
        .unwrap();

    let retryable = queries::list_failed_provisioning(&conn, 5).unwrap();
    assert_eq!(retryable.len(), 1);
    assert_eq!(retryable[0].id, failed.id, "capped orders are not retried");

    // Fresh pending orders are not stale yet.
    let now = chrono::Utc::now().timestamp();
    assert!(queries::list_stale_pending(&conn, now - 300).unwrap().is_empty());
    let stale = queries::list_stale_pending(&conn, now + 1).unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, pending.id);
}
