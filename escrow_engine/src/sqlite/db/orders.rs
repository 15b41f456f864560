use chrono::{DateTime, Utc};
use log::*;
use sqlx::SqliteConnection;

use crate::{
    db_types::{derive_order_status, ItemStatus, Order, OrderDraft, OrderStatusType},
    traits::MarketplaceDbError,
};

/// Inserts the order row only. Call this inside a transaction together with the item and transaction inserts.
pub async fn insert_order(
    draft: &OrderDraft,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Order, MarketplaceDbError> {
    let order: Order = sqlx::query_as(
        r#"
            INSERT INTO orders (
                order_ref,
                buyer_id,
                shipping_address_id,
                payment_method,
                total_amount,
                status,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING *;
        "#,
    )
    .bind(draft.order_ref())
    .bind(draft.buyer_id())
    .bind(draft.shipping_address_id())
    .bind(draft.payment_method())
    .bind(draft.total_amount())
    .bind(OrderStatusType::Pending)
    .bind(now)
    .fetch_one(conn)
    .await?;
    debug!("🗃️ Order #{} inserted with reference {}", order.id, order.order_ref);
    Ok(order)
}

pub async fn fetch_order(id: i64, conn: &mut SqliteConnection) -> Result<Option<Order>, MarketplaceDbError> {
    let order = sqlx::query_as("SELECT * FROM orders WHERE id = $1").bind(id).fetch_optional(conn).await?;
    Ok(order)
}

/// The orders paid (or to be paid) with the given provider charge.
pub async fn fetch_orders_for_charge(
    charge_id: &str,
    conn: &mut SqliteConnection,
) -> Result<Vec<Order>, MarketplaceDbError> {
    let orders = sqlx::query_as(
        r#"
        SELECT * FROM orders WHERE id IN (
            SELECT order_items.order_id FROM transactions
            JOIN order_items ON order_items.id = transactions.order_item_id
            WHERE transactions.charge_id = $1
        ) ORDER BY id
        "#,
    )
    .bind(charge_id)
    .fetch_all(conn)
    .await?;
    Ok(orders)
}

/// Orders in the given status, oldest first. Time filtering is left to the caller since timestamps are stored as
/// text.
pub async fn fetch_orders_with_status(
    status: OrderStatusType,
    conn: &mut SqliteConnection,
) -> Result<Vec<Order>, MarketplaceDbError> {
    let orders = sqlx::query_as("SELECT * FROM orders WHERE status = $1 ORDER BY created_at ASC, id ASC")
        .bind(status)
        .fetch_all(conn)
        .await?;
    Ok(orders)
}

/// `Pending → Processing`, stamping `paid_at`.
pub async fn mark_paid(id: i64, now: DateTime<Utc>, conn: &mut SqliteConnection) -> Result<Order, MarketplaceDbError> {
    let order: Option<Order> = sqlx::query_as(
        "UPDATE orders SET status = $1, paid_at = $2, updated_at = $2 WHERE id = $3 AND status = $4 RETURNING *",
    )
    .bind(OrderStatusType::Processing)
    .bind(now)
    .bind(id)
    .bind(OrderStatusType::Pending)
    .fetch_optional(&mut *conn)
    .await?;
    match order {
        Some(o) => Ok(o),
        None => match fetch_order(id, conn).await? {
            Some(o) => Err(MarketplaceDbError::ConcurrencyConflict(format!(
                "Order #{id} is {} and can no longer be marked as paid",
                o.status
            ))),
            None => Err(MarketplaceDbError::OrderNotFound(id)),
        },
    }
}

/// Recomputes the order status from its items and persists it if it changed. `delivered_at` is stamped the first
/// time the order becomes `Delivered`.
pub async fn sync_order_status(
    id: i64,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Order, MarketplaceDbError> {
    let order = fetch_order(id, &mut *conn).await?.ok_or(MarketplaceDbError::OrderNotFound(id))?;
    let statuses: Vec<ItemStatus> = sqlx::query_scalar("SELECT status FROM order_items WHERE order_id = $1")
        .bind(id)
        .fetch_all(&mut *conn)
        .await?;
    let derived = derive_order_status(&statuses);
    if derived == order.status {
        trace!("🗃️ Order #{id} remains {derived}");
        return Ok(order);
    }
    let delivered_at = match derived {
        OrderStatusType::Delivered => order.delivered_at.or(Some(now)),
        _ => order.delivered_at,
    };
    let updated: Option<Order> = sqlx::query_as(
        "UPDATE orders SET status = $1, delivered_at = $2, updated_at = $3 WHERE id = $4 AND status = $5 RETURNING *",
    )
    .bind(derived)
    .bind(delivered_at)
    .bind(now)
    .bind(id)
    .bind(order.status)
    .fetch_optional(conn)
    .await?;
    let updated = updated.ok_or_else(|| {
        MarketplaceDbError::ConcurrencyConflict(format!("Order #{id} changed while its status was being recomputed"))
    })?;
    debug!("🗃️ Order #{id} status {} -> {}", order.status, updated.status);
    Ok(updated)
}
