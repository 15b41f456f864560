//! Escrow status transitions and the append-only ledger.
//!
//! Every change of an item's escrow status writes exactly one ledger entry in the same unit of work. The ledger table
//! has triggers that reject updates and deletes.
use chrono::{DateTime, Utc};
use log::*;
use sqlx::SqliteConnection;

use crate::{
    db_types::{EscrowMovement, EscrowRelease, EscrowStatus, LedgerDirection, NewLedgerEntry, OrderItem},
    sqlite::db::{items, profiles},
    traits::MarketplaceDbError,
};

pub async fn insert_ledger_entry(
    entry: NewLedgerEntry,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<EscrowRelease, MarketplaceDbError> {
    let entry: EscrowRelease = sqlx::query_as(
        r#"
        INSERT INTO escrow_releases (order_item_id, amount, direction, movement, reason, external_ref, completed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(entry.order_item_id)
    .bind(entry.amount)
    .bind(entry.direction)
    .bind(entry.movement)
    .bind(entry.reason)
    .bind(entry.external_ref)
    .bind(now)
    .fetch_one(conn)
    .await?;
    debug!(
        "🗃️ Ledger #{}: {} of {} {} for item #{}",
        entry.id, entry.movement, entry.amount, entry.direction, entry.order_item_id
    );
    Ok(entry)
}

pub async fn fetch_ledger(item_id: i64, conn: &mut SqliteConnection) -> Result<Vec<EscrowRelease>, MarketplaceDbError> {
    let entries = sqlx::query_as("SELECT * FROM escrow_releases WHERE order_item_id = $1 ORDER BY id ASC")
        .bind(item_id)
        .fetch_all(conn)
        .await?;
    Ok(entries)
}

pub async fn ledger_has_reference(
    item_id: i64,
    external_ref: &str,
    conn: &mut SqliteConnection,
) -> Result<bool, MarketplaceDbError> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM escrow_releases WHERE order_item_id = $1 AND external_ref = $2")
            .bind(item_id)
            .bind(external_ref)
            .fetch_one(conn)
            .await?;
    Ok(count > 0)
}

pub async fn fetch_items_with_escrow_status(
    status: EscrowStatus,
    conn: &mut SqliteConnection,
) -> Result<Vec<OrderItem>, MarketplaceDbError> {
    let items = sqlx::query_as("SELECT * FROM order_items WHERE escrow_status = $1 ORDER BY id")
        .bind(status)
        .fetch_all(conn)
        .await?;
    Ok(items)
}

/// Conditional escrow status update. Fails with `ConcurrencyConflict` if the item is not in `from` any more.
pub async fn update_escrow_status(
    item_id: i64,
    from: EscrowStatus,
    to: EscrowStatus,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<OrderItem, MarketplaceDbError> {
    if !from.can_transition_to(to) {
        return Err(MarketplaceDbError::IllegalEscrowTransition { item_id, from, to });
    }
    let item: Option<OrderItem> = sqlx::query_as(
        "UPDATE order_items SET escrow_status = $1, updated_at = $2 WHERE id = $3 AND escrow_status = $4 RETURNING *",
    )
    .bind(to)
    .bind(now)
    .bind(item_id)
    .bind(from)
    .fetch_optional(&mut *conn)
    .await?;
    match item {
        Some(item) => {
            trace!("🗃️ Escrow for item #{item_id}: {from} -> {to}");
            Ok(item)
        },
        None => match items::fetch_item(item_id, conn).await? {
            Some(item) => Err(MarketplaceDbError::ConcurrencyConflict(format!(
                "Escrow for order item #{item_id} was expected to be {from}, but is {}",
                item.escrow_status
            ))),
            None => Err(MarketplaceDbError::ItemNotFound(item_id)),
        },
    }
}

/// Releases the seller's share of a held item. Returns `None` when the escrow had already been released, so repeated
/// calls leave a single ledger entry.
pub async fn release(
    item: &OrderItem,
    reason: &str,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Option<EscrowRelease>, MarketplaceDbError> {
    if item.escrow_status.is_released() {
        debug!("🗃️ Escrow for item #{} is already {}. Nothing to release.", item.id, item.escrow_status);
        return Ok(None);
    }
    let updated = update_escrow_status(item.id, item.escrow_status, EscrowStatus::Released, now, conn).await?;
    let entry = NewLedgerEntry {
        order_item_id: updated.id,
        amount: updated.seller_payout(),
        direction: LedgerDirection::ToSeller,
        movement: EscrowMovement::Release,
        reason: reason.to_string(),
        external_ref: None,
    };
    let entry = insert_ledger_entry(entry, now, conn).await?;
    profiles::increment_completed_transactions(updated.seller_id, conn).await?;
    Ok(Some(entry))
}

/// Returns the full price of a held item to the buyer. Returns `None` when the escrow had already been refunded.
pub async fn refund(
    item: &OrderItem,
    reason: &str,
    external_ref: Option<&str>,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Option<EscrowRelease>, MarketplaceDbError> {
    if item.escrow_status == EscrowStatus::Refunded {
        debug!("🗃️ Escrow for item #{} is already refunded.", item.id);
        return Ok(None);
    }
    let updated = update_escrow_status(item.id, item.escrow_status, EscrowStatus::Refunded, now, conn).await?;
    let entry = NewLedgerEntry {
        order_item_id: updated.id,
        amount: updated.price,
        direction: LedgerDirection::ToBuyer,
        movement: EscrowMovement::Refund,
        reason: reason.to_string(),
        external_ref: external_ref.map(String::from),
    };
    let entry = insert_ledger_entry(entry, now, conn).await?;
    Ok(Some(entry))
}

/// Records a successful payout. Allowed from `Released` and, after an operator retry, from `TransferFailed`.
pub async fn record_transfer(
    item: &OrderItem,
    transfer_id: &str,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<EscrowRelease, MarketplaceDbError> {
    let updated = update_escrow_status(item.id, item.escrow_status, EscrowStatus::Transferred, now, conn).await?;
    let entry = NewLedgerEntry {
        order_item_id: updated.id,
        amount: updated.seller_payout(),
        direction: LedgerDirection::ToSeller,
        movement: EscrowMovement::Transfer,
        reason: "Payout to seller".to_string(),
        external_ref: Some(transfer_id.to_string()),
    };
    insert_ledger_entry(entry, now, conn).await
}

/// Records a failed payout. A `Released` item moves to `TransferFailed`. For an item that is already `TransferFailed`
/// only the ledger entry is written.
pub async fn record_transfer_failure(
    item: &OrderItem,
    reason: &str,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<EscrowRelease, MarketplaceDbError> {
    match item.escrow_status {
        EscrowStatus::TransferFailed => {},
        from => {
            update_escrow_status(item.id, from, EscrowStatus::TransferFailed, now, conn).await?;
        },
    }
    let entry = NewLedgerEntry {
        order_item_id: item.id,
        amount: item.seller_payout(),
        direction: LedgerDirection::ToSeller,
        movement: EscrowMovement::TransferFailure,
        reason: reason.to_string(),
        external_ref: None,
    };
    insert_ledger_entry(entry, now, conn).await
}
