use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    db_types::{EscrowRelease, EscrowStatus, FeeTier, ItemStatus, Order, OrderDraft, PaymentMethod},
    traits::{
        data_objects::{CancelledItem, ItemDetails, ItemTransition, OrderDetails, OrderPaid},
        CatalogManagement,
        ProfileManagement,
    },
};

/// This trait defines the highest level of behaviour for backends supporting the order and escrow engine.
///
/// Methods that write take `now` explicitly instead of reading the clock, so that callers (and tests) control time.
#[allow(async_fn_in_trait)]
pub trait MarketplaceDatabase: Clone + CatalogManagement + ProfileManagement {
    /// The URL of the database
    fn url(&self) -> &str;

    async fn fetch_fee_tiers(&self) -> Result<Vec<FeeTier>, MarketplaceDbError>;

    /// Persists the order, its items and one transaction per item in a single atomic unit. Items start `Pending` with
    /// escrow `Holding`. The charge must already exist at the provider.
    async fn insert_order(
        &self,
        draft: &OrderDraft,
        charge_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OrderDetails, MarketplaceDbError>;

    async fn fetch_order(&self, order_id: i64) -> Result<Option<Order>, MarketplaceDbError>;

    async fn fetch_order_details(&self, order_id: i64) -> Result<Option<OrderDetails>, MarketplaceDbError>;

    async fn fetch_item_details(&self, item_id: i64) -> Result<Option<ItemDetails>, MarketplaceDbError>;

    async fn fetch_orders_for_charge(&self, charge_id: &str) -> Result<Vec<Order>, MarketplaceDbError>;

    /// `Pending` orders created at or before `cutoff`, oldest first.
    async fn fetch_pending_orders_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Order>, MarketplaceDbError>;

    /// Items with escrow `Released` whose delivery was recorded at or before `cutoff`.
    async fn fetch_released_items_delivered_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ItemDetails>, MarketplaceDbError>;

    /// Moves a `Pending` order and all of its `Pending` items to `Processing`, stamps `paid_at` and marks the products
    /// as sold.
    async fn mark_order_paid(&self, order_id: i64, now: DateTime<Utc>) -> Result<OrderPaid, MarketplaceDbError>;

    /// `Processing → Shipped`, recording the tracking number. The order status is recomputed.
    async fn ship_item(
        &self,
        item_id: i64,
        tracking_number: &str,
        now: DateTime<Utc>,
    ) -> Result<ItemTransition, MarketplaceDbError>;

    /// `Shipped → Delivered`. Escrow is released in the same unit of work and the order status is recomputed.
    async fn deliver_item(&self, item_id: i64, now: DateTime<Utc>) -> Result<ItemTransition, MarketplaceDbError>;

    /// Claims the given items of an order for the refund identified by `claim`, ahead of asking the provider for the
    /// money back. Claimed items cannot be shipped, paid or cancelled under a different claim. Claiming again with
    /// the same claim succeeds. If any item is missing, in another status or held by another claim, nothing is
    /// claimed.
    async fn claim_items_for_refund(
        &self,
        order_id: i64,
        items: &[CancelledItem],
        claim: &str,
    ) -> Result<(), MarketplaceDbError>;

    /// Drops a refund claim without cancelling anything. Returns the number of items released.
    async fn release_refund_claim(&self, claim: &str) -> Result<u64, MarketplaceDbError>;

    /// Cancels the given items of an order after the provider has refunded them under `claim`. Each item's escrow
    /// becomes `Refunded`, its product goes back on sale and the order status is recomputed. If any item is no longer
    /// held by the claim, nothing changes.
    async fn cancel_items(
        &self,
        order_id: i64,
        items: &[CancelledItem],
        claim: &str,
        refund_ref: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(OrderDetails, Vec<EscrowRelease>), MarketplaceDbError>;

    /// `Holding → Released`, crediting the seller's payout to the ledger and bumping the seller's completed
    /// transaction counter. Returns `None` if the item was already released.
    async fn release_escrow(
        &self,
        item_id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EscrowRelease>, MarketplaceDbError>;

    /// `Holding → Refunded`, crediting the full price back to the buyer. Returns `None` if the item was already
    /// refunded.
    async fn refund_escrow(
        &self,
        item_id: i64,
        reason: &str,
        external_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<EscrowRelease>, MarketplaceDbError>;

    /// `Released | TransferFailed → Transferred`, with a ledger entry carrying the provider's transfer id.
    async fn record_transfer(
        &self,
        item_id: i64,
        transfer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EscrowRelease, MarketplaceDbError>;

    /// Records a failed payout. A `Released` item becomes `TransferFailed`. An item that is already `TransferFailed`
    /// only gains another ledger entry.
    async fn record_transfer_failure(
        &self,
        item_id: i64,
        expected: EscrowStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<EscrowRelease, MarketplaceDbError>;

    /// The ledger entries of an item, in the order they were written.
    async fn fetch_ledger(&self, item_id: i64) -> Result<Vec<EscrowRelease>, MarketplaceDbError>;

    async fn ledger_has_reference(&self, item_id: i64, external_ref: &str) -> Result<bool, MarketplaceDbError>;

    /// Opens a dispute on every transaction paid with `charge_id`. Returns the number of transactions that changed.
    async fn mark_disputed(&self, charge_id: &str) -> Result<u64, MarketplaceDbError>;

    async fn is_webhook_processed(&self, provider: PaymentMethod, event_id: &str) -> Result<bool, MarketplaceDbError>;

    /// Returns `false` if the event had already been recorded.
    async fn mark_webhook_processed(
        &self,
        provider: PaymentMethod,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, MarketplaceDbError>;

    /// Closes the database connection.
    async fn close(&mut self) -> Result<(), MarketplaceDbError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
pub enum MarketplaceDbError {
    #[error("We have an internal database engine (configuration/uptime etc.) : {0}")]
    DatabaseError(String),
    #[error("The requested order {0} does not exist")]
    OrderNotFound(i64),
    #[error("The requested order item {0} does not exist")]
    ItemNotFound(i64),
    #[error("An order with reference {0} already exists")]
    OrderRefExists(String),
    #[error("Order item {item_id} cannot move from {from} to {to}")]
    IllegalItemTransition { item_id: i64, from: ItemStatus, to: ItemStatus },
    #[error("Escrow for order item {item_id} cannot move from {from} to {to}")]
    IllegalEscrowTransition { item_id: i64, from: EscrowStatus, to: EscrowStatus },
    #[error("The record changed while it was being updated. {0}")]
    ConcurrencyConflict(String),
}

impl From<sqlx::Error> for MarketplaceDbError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(ref de) if de.is_unique_violation() && de.message().contains("order_ref") => {
                MarketplaceDbError::OrderRefExists(de.message().to_string())
            },
            e => MarketplaceDbError::DatabaseError(e.to_string()),
        }
    }
}
