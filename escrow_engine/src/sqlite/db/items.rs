use chrono::{DateTime, Utc};
use log::*;
use sqlx::SqliteConnection;

use crate::{
    db_types::{DisputeStatus, ItemStatus, NewLineItem, OrderItem, Transaction},
    traits::{ItemDetails, MarketplaceDbError},
};

pub async fn insert_item(
    order_id: i64,
    line: &NewLineItem,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<OrderItem, MarketplaceDbError> {
    let item = sqlx::query_as(
        r#"
        INSERT INTO order_items (order_id, product_id, seller_id, price, platform_fee, fee_rate, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
        RETURNING *
        "#,
    )
    .bind(order_id)
    .bind(line.product_id)
    .bind(line.seller_id)
    .bind(line.price)
    .bind(line.platform_fee)
    .bind(line.fee_rate)
    .bind(now)
    .fetch_one(conn)
    .await?;
    Ok(item)
}

/// Creates the transaction for a freshly inserted item. The monetary fields are copied from the item and can never
/// change afterwards.
pub async fn insert_transaction(
    item: &OrderItem,
    charge_id: &str,
    gateway_order_code: &str,
    shipping_snapshot: &str,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Transaction, MarketplaceDbError> {
    let tx = sqlx::query_as(
        r#"
        INSERT INTO transactions (
            order_item_id,
            charge_id,
            gateway_order_code,
            amount,
            platform_fee,
            fee_rate,
            shipping_snapshot,
            created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(item.id)
    .bind(charge_id)
    .bind(gateway_order_code)
    .bind(item.price)
    .bind(item.platform_fee)
    .bind(item.fee_rate)
    .bind(shipping_snapshot)
    .bind(now)
    .fetch_one(conn)
    .await?;
    Ok(tx)
}

pub async fn fetch_item(id: i64, conn: &mut SqliteConnection) -> Result<Option<OrderItem>, MarketplaceDbError> {
    let item = sqlx::query_as("SELECT * FROM order_items WHERE id = $1").bind(id).fetch_optional(conn).await?;
    Ok(item)
}

pub async fn fetch_items_for_order(
    order_id: i64,
    conn: &mut SqliteConnection,
) -> Result<Vec<OrderItem>, MarketplaceDbError> {
    let items = sqlx::query_as("SELECT * FROM order_items WHERE order_id = $1 ORDER BY id")
        .bind(order_id)
        .fetch_all(conn)
        .await?;
    Ok(items)
}

pub async fn fetch_transaction_for_item(
    item_id: i64,
    conn: &mut SqliteConnection,
) -> Result<Option<Transaction>, MarketplaceDbError> {
    let tx = sqlx::query_as("SELECT * FROM transactions WHERE order_item_id = $1")
        .bind(item_id)
        .fetch_optional(conn)
        .await?;
    Ok(tx)
}

pub async fn fetch_item_details(
    item_id: i64,
    conn: &mut SqliteConnection,
) -> Result<Option<ItemDetails>, MarketplaceDbError> {
    let item = match fetch_item(item_id, &mut *conn).await? {
        Some(item) => item,
        None => return Ok(None),
    };
    let transaction = fetch_transaction_for_item(item_id, conn).await?.ok_or_else(|| {
        MarketplaceDbError::DatabaseError(format!("Order item #{item_id} has no transaction. This is a data integrity bug."))
    })?;
    Ok(Some(ItemDetails { item, transaction }))
}

pub async fn fetch_details_for_order(
    order_id: i64,
    conn: &mut SqliteConnection,
) -> Result<Vec<ItemDetails>, MarketplaceDbError> {
    let items = fetch_items_for_order(order_id, &mut *conn).await?;
    let mut result = Vec::with_capacity(items.len());
    for item in items {
        let id = item.id;
        let transaction = fetch_transaction_for_item(id, &mut *conn).await?.ok_or_else(|| {
            MarketplaceDbError::DatabaseError(format!("Order item #{id} has no transaction. This is a data integrity bug."))
        })?;
        result.push(ItemDetails { item, transaction });
    }
    Ok(result)
}

/// Moves an item from `from` to `to`. If the item is no longer in `from`, or a refund has claimed it, the update is
/// refused with a `ConcurrencyConflict`.
pub async fn update_item_status(
    id: i64,
    from: ItemStatus,
    to: ItemStatus,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<OrderItem, MarketplaceDbError> {
    if !from.can_transition_to(to) {
        return Err(MarketplaceDbError::IllegalItemTransition { item_id: id, from, to });
    }
    let item: Option<OrderItem> = sqlx::query_as(
        r#"UPDATE order_items SET status = $1, updated_at = $2
           WHERE id = $3 AND status = $4 AND refund_claim IS NULL
           RETURNING *"#,
    )
    .bind(to)
    .bind(now)
    .bind(id)
    .bind(from)
    .fetch_optional(&mut *conn)
    .await?;
    match item {
        Some(item) => {
            trace!("🗃️ Order item #{id} status {from} -> {to}");
            Ok(item)
        },
        None => Err(conflict(id, from, conn).await),
    }
}

async fn conflict(id: i64, expected: ItemStatus, conn: &mut SqliteConnection) -> MarketplaceDbError {
    let claim = sqlx::query_as::<_, (ItemStatus, Option<String>)>(
        "SELECT status, refund_claim FROM order_items WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(conn)
    .await;
    match claim {
        Ok(Some((status, _))) if status != expected => MarketplaceDbError::ConcurrencyConflict(format!(
            "Order item #{id} was expected to be {expected}, but is {status}"
        )),
        Ok(Some((_, Some(_)))) => {
            MarketplaceDbError::ConcurrencyConflict(format!("Order item #{id} is being refunded by another request"))
        },
        Ok(Some(_)) => MarketplaceDbError::ConcurrencyConflict(format!("Order item #{id} changed during the update")),
        Ok(None) => MarketplaceDbError::ItemNotFound(id),
        Err(e) => e.into(),
    }
}

/// Claims an item of `order_id` for the refund identified by `claim`. The item must be in `expected` status and
/// either unclaimed or already held by the same claim.
pub async fn claim_for_refund(
    id: i64,
    order_id: i64,
    expected: ItemStatus,
    claim: &str,
    conn: &mut SqliteConnection,
) -> Result<(), MarketplaceDbError> {
    let result = sqlx::query(
        r#"UPDATE order_items SET refund_claim = $1
           WHERE id = $2 AND order_id = $3 AND status = $4 AND (refund_claim IS NULL OR refund_claim = $1)"#,
    )
    .bind(claim)
    .bind(id)
    .bind(order_id)
    .bind(expected)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return match fetch_item(id, &mut *conn).await? {
            Some(item) if item.order_id != order_id => Err(MarketplaceDbError::ConcurrencyConflict(format!(
                "Order item #{id} does not belong to order #{order_id}"
            ))),
            Some(_) => Err(conflict(id, expected, conn).await),
            None => Err(MarketplaceDbError::ItemNotFound(id)),
        };
    }
    trace!("🗃️ Order item #{id} claimed for refund {claim}");
    Ok(())
}

pub async fn release_refund_claim(claim: &str, conn: &mut SqliteConnection) -> Result<u64, MarketplaceDbError> {
    let result = sqlx::query("UPDATE order_items SET refund_claim = NULL WHERE refund_claim = $1")
        .bind(claim)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

/// Cancels an item held under `claim`, and settles the claim.
pub async fn cancel_claimed_item(
    id: i64,
    claim: &str,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<OrderItem, MarketplaceDbError> {
    let item: Option<OrderItem> = sqlx::query_as(
        r#"UPDATE order_items SET status = $1, refund_claim = NULL, updated_at = $2
           WHERE id = $3 AND refund_claim = $4 AND status IN ($5, $6)
           RETURNING *"#,
    )
    .bind(ItemStatus::Cancelled)
    .bind(now)
    .bind(id)
    .bind(claim)
    .bind(ItemStatus::Pending)
    .bind(ItemStatus::Processing)
    .fetch_optional(&mut *conn)
    .await?;
    match item {
        Some(item) => {
            trace!("🗃️ Order item #{id} cancelled under refund {claim}");
            Ok(item)
        },
        None => match fetch_item(id, conn).await? {
            Some(item) => Err(MarketplaceDbError::ConcurrencyConflict(format!(
                "Order item #{id} is {} and no longer held for refund {claim}",
                item.status
            ))),
            None => Err(MarketplaceDbError::ItemNotFound(id)),
        },
    }
}

/// Stamps `paid_at` on every transaction of the order.
pub async fn record_payment(
    order_id: i64,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<(), MarketplaceDbError> {
    sqlx::query(
        r#"UPDATE transactions SET paid_at = $1
           WHERE paid_at IS NULL AND order_item_id IN (SELECT id FROM order_items WHERE order_id = $2)"#,
    )
    .bind(now)
    .bind(order_id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn record_shipment(
    item_id: i64,
    tracking_number: &str,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<(), MarketplaceDbError> {
    sqlx::query("UPDATE transactions SET tracking_number = $1, shipped_at = $2 WHERE order_item_id = $3")
        .bind(tracking_number)
        .bind(now)
        .bind(item_id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn record_delivery(
    item_id: i64,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<(), MarketplaceDbError> {
    sqlx::query("UPDATE transactions SET delivered_at = $1 WHERE order_item_id = $2 AND delivered_at IS NULL")
        .bind(now)
        .bind(item_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Opens a dispute on every transaction of the charge that does not already have one.
pub async fn mark_disputed(charge_id: &str, conn: &mut SqliteConnection) -> Result<u64, MarketplaceDbError> {
    let result = sqlx::query("UPDATE transactions SET dispute_status = $1 WHERE charge_id = $2 AND dispute_status != $1")
        .bind(DisputeStatus::Open)
        .bind(charge_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}
