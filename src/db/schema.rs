use rusqlite::Connection;

/// Initialize the database schema.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Catalog items (purchasable data plans, owned by the catalog sync)
        CREATE TABLE IF NOT EXISTS catalog_items (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            region TEXT,
            data_amount INTEGER NOT NULL,
            data_unit TEXT NOT NULL DEFAULT 'GB',
            validity_days INTEGER NOT NULL,
            prices TEXT NOT NULL,
            provider_package_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Orders (one durable record per payment session)
        -- The unique index on payment_session_id is the webhook idempotency
        -- key: a duplicate delivery's claim insert affects zero rows.
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            payment_session_id TEXT NOT NULL,
            catalog_item_id TEXT NOT NULL REFERENCES catalog_items(id),
            email TEXT,
            customer_name TEXT,
            amount_cents INTEGER NOT NULL,
            currency TEXT NOT NULL,
            fulfillment_status TEXT NOT NULL CHECK (fulfillment_status IN (
                'pending_provisioning', 'provisioned', 'notified',
                'failed_provisioning', 'failed_notification'
            )),
            upstream_order_id TEXT,
            activation_status TEXT,
            sim_iccid TEXT,
            qr_code_url TEXT,
            direct_install_url TEXT,
            data_balance TEXT,
            provision_attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            notified_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_payment_session ON orders(payment_session_id);
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(fulfillment_status);
        "#,
    )
}
