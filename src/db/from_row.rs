//! Row mapping trait and helpers for reducing boilerplate in queries.

use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension, Row, ToSql};

use crate::models::*;

/// Parse a string column into an enum type, converting parse errors to rusqlite errors.
fn parse_enum<T: std::str::FromStr>(row: &Row, col: usize, col_name: &str) -> rusqlite::Result<T> {
    row.get::<_, String>(col)?.parse::<T>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(col, col_name.to_string(), rusqlite::types::Type::Text)
    })
}

/// Parse a JSON text column, converting parse errors to rusqlite errors.
fn parse_json<T: serde::de::DeserializeOwned>(
    row: &Row,
    col: usize,
    col_name: &str,
) -> rusqlite::Result<T> {
    let raw: String = row.get(col)?;
    serde_json::from_str(&raw).map_err(|_| {
        rusqlite::Error::InvalidColumnType(col, col_name.to_string(), rusqlite::types::Type::Text)
    })
}

/// Trait for constructing a type from a database row.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

/// Query for a single optional result.
pub fn query_one<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Option<T>> {
    conn.query_row(sql, params, T::from_row)
        .optional()
        .map_err(Into::into)
}

/// Query for multiple results.
pub fn query_all<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, T::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============ SQL SELECT Constants ============

pub const CATALOG_ITEM_COLS: &str = "id, name, region, data_amount, data_unit, validity_days, prices, provider_package_id, created_at, updated_at";

pub const ORDER_COLS: &str = "id, payment_session_id, catalog_item_id, email, customer_name, amount_cents, currency, fulfillment_status, upstream_order_id, activation_status, sim_iccid, qr_code_url, direct_install_url, data_balance, provision_attempts, last_error, notified_at, created_at, updated_at";

// ============ FromRow Implementations ============

impl FromRow for CatalogItem {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let prices: HashMap<String, i64> = parse_json(row, 6, "prices")?;
        Ok(CatalogItem {
            id: row.get(0)?,
            name: row.get(1)?,
            region: row.get(2)?,
            data_amount: row.get(3)?,
            data_unit: row.get(4)?,
            validity_days: row.get(5)?,
            prices,
            provider_package_id: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

impl FromRow for OrderRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(OrderRecord {
            id: row.get(0)?,
            payment_session_id: row.get(1)?,
            catalog_item_id: row.get(2)?,
            email: row.get(3)?,
            customer_name: row.get(4)?,
            amount_cents: row.get(5)?,
            currency: row.get(6)?,
            fulfillment_status: parse_enum(row, 7, "fulfillment_status")?,
            upstream_order_id: row.get(8)?,
            activation_status: row.get(9)?,
            sim_iccid: row.get(10)?,
            qr_code_url: row.get(11)?,
            direct_install_url: row.get(12)?,
            data_balance: row.get(13)?,
            provision_attempts: row.get(14)?,
            last_error: row.get(15)?,
            notified_at: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }
}
