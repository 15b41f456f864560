//! `SqliteDatabase` is a concrete implementation of an order and escrow engine backend.
//!
//! Unsurprisingly, it uses SQLite as the backend and implements all the traits defined in the [`crate::traits`]
//! module. Each trait method that writes opens a single transaction, so a failure part-way through leaves nothing
//! behind.
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use log::*;
use market_common::Money;
use sqlx::{migrate, SqliteConnection, SqlitePool};

use super::db::{catalog, db_url, escrow, fee_tiers, items, new_pool, orders, profiles, webhooks};
use crate::{
    db_types::{
        Address,
        EscrowRelease,
        EscrowStatus,
        FeeTier,
        ItemStatus,
        Offer,
        OfferStatus,
        Order,
        OrderDraft,
        OrderItem,
        OrderStatusType,
        PaymentMethod,
        Product,
        ProductStatus,
        SellerProfile,
    },
    traits::{
        CancelledItem,
        CatalogManagement,
        ItemDetails,
        ItemTransition,
        MarketplaceDatabase,
        MarketplaceDbError,
        OrderDetails,
        OrderPaid,
        ProfileManagement,
    },
};

#[derive(Clone)]
pub struct SqliteDatabase {
    url: String,
    pool: SqlitePool,
}

impl Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "SqliteDatabase ({:?})", self.pool)
    }
}

impl SqliteDatabase {
    /// Creates a new database API object using the URL in `MKT_DATABASE_URL`, or the default.
    pub async fn new(max_connections: u32) -> Result<Self, sqlx::Error> {
        let url = db_url();
        SqliteDatabase::new_with_url(&url, max_connections).await
    }

    pub async fn new_with_url(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        trace!("🗃️ Creating new database connection pool with url {url}");
        let pool = new_pool(url, max_connections).await?;
        Ok(Self { url: url.to_string(), pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Brings the schema up to date using the migrations embedded in this crate.
    pub async fn migrate(&self) -> Result<(), MarketplaceDbError> {
        migrate!("./src/sqlite/migrations")
            .run(&self.pool)
            .await
            .map_err(|e| MarketplaceDbError::DatabaseError(format!("Migration failed. {e}")))?;
        info!("🗃️ Database migrations are up to date");
        Ok(())
    }

    /// Replaces the fee schedule.
    pub async fn replace_fee_tiers(&self, tiers: &[FeeTier]) -> Result<(), MarketplaceDbError> {
        let mut tx = self.pool.begin().await?;
        fee_tiers::replace_fee_tiers(tiers, &mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn require_item(item_id: i64, conn: &mut SqliteConnection) -> Result<OrderItem, MarketplaceDbError> {
        items::fetch_item(item_id, conn).await?.ok_or(MarketplaceDbError::ItemNotFound(item_id))
    }
}

impl MarketplaceDatabase for SqliteDatabase {
    fn url(&self) -> &str {
        self.url.as_str()
    }

    async fn fetch_fee_tiers(&self) -> Result<Vec<FeeTier>, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        fee_tiers::fetch_fee_tiers(&mut conn).await
    }

    async fn insert_order(
        &self,
        draft: &OrderDraft,
        charge_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OrderDetails, MarketplaceDbError> {
        let mut tx = self.pool.begin().await?;
        let order = orders::insert_order(draft, now, &mut tx).await?;
        let mut details = Vec::with_capacity(draft.lines().len());
        for line in draft.lines() {
            let item = items::insert_item(order.id, line, now, &mut tx).await?;
            let transaction =
                items::insert_transaction(&item, charge_id, draft.order_ref(), draft.shipping_snapshot(), now, &mut tx)
                    .await?;
            details.push(ItemDetails { item, transaction });
        }
        tx.commit().await?;
        debug!("🗃️ Order #{} saved with {} items, total {}", order.id, details.len(), order.total_amount);
        Ok(OrderDetails { order, items: details })
    }

    async fn fetch_order(&self, order_id: i64) -> Result<Option<Order>, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        orders::fetch_order(order_id, &mut conn).await
    }

    async fn fetch_order_details(&self, order_id: i64) -> Result<Option<OrderDetails>, MarketplaceDbError> {
        let mut tx = self.pool.begin().await?;
        let order = match orders::fetch_order(order_id, &mut tx).await? {
            Some(o) => o,
            None => return Ok(None),
        };
        let items = items::fetch_details_for_order(order_id, &mut tx).await?;
        tx.commit().await?;
        Ok(Some(OrderDetails { order, items }))
    }

    async fn fetch_item_details(&self, item_id: i64) -> Result<Option<ItemDetails>, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        items::fetch_item_details(item_id, &mut conn).await
    }

    async fn fetch_orders_for_charge(&self, charge_id: &str) -> Result<Vec<Order>, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        orders::fetch_orders_for_charge(charge_id, &mut conn).await
    }

    async fn fetch_pending_orders_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Order>, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        let pending = orders::fetch_orders_with_status(OrderStatusType::Pending, &mut conn).await?;
        Ok(pending.into_iter().filter(|o| o.created_at <= cutoff).collect())
    }

    async fn fetch_released_items_delivered_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ItemDetails>, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        let released = escrow::fetch_items_with_escrow_status(EscrowStatus::Released, &mut conn).await?;
        let mut result = Vec::new();
        for item in released {
            let details = match items::fetch_item_details(item.id, &mut conn).await? {
                Some(d) => d,
                None => continue,
            };
            match details.transaction.delivered_at {
                Some(delivered) if delivered <= cutoff => result.push(details),
                Some(_) => {},
                None => warn!("🗃️ Item #{} is released but has no delivery date. It will not be paid out.", item.id),
            }
        }
        Ok(result)
    }

    async fn mark_order_paid(&self, order_id: i64, now: DateTime<Utc>) -> Result<OrderPaid, MarketplaceDbError> {
        let mut tx = self.pool.begin().await?;
        let order = orders::mark_paid(order_id, now, &mut tx).await?;
        let mut paid_items = Vec::new();
        for item in items::fetch_items_for_order(order_id, &mut tx).await? {
            if item.status != ItemStatus::Pending {
                trace!("🗃️ Item #{} is {} and is not affected by payment", item.id, item.status);
                paid_items.push(item);
                continue;
            }
            let item = items::update_item_status(item.id, ItemStatus::Pending, ItemStatus::Processing, now, &mut tx)
                .await?;
            catalog::set_product_status(item.product_id, ProductStatus::Sold, &mut tx).await?;
            paid_items.push(item);
        }
        items::record_payment(order_id, now, &mut tx).await?;
        tx.commit().await?;
        debug!("🗃️ Order #{order_id} marked as paid");
        Ok(OrderPaid { order, items: paid_items })
    }

    async fn ship_item(
        &self,
        item_id: i64,
        tracking_number: &str,
        now: DateTime<Utc>,
    ) -> Result<ItemTransition, MarketplaceDbError> {
        let mut tx = self.pool.begin().await?;
        let item = items::update_item_status(item_id, ItemStatus::Processing, ItemStatus::Shipped, now, &mut tx).await?;
        items::record_shipment(item_id, tracking_number, now, &mut tx).await?;
        let order = orders::sync_order_status(item.order_id, now, &mut tx).await?;
        tx.commit().await?;
        Ok(ItemTransition { item, order, ledger_entry: None })
    }

    async fn deliver_item(&self, item_id: i64, now: DateTime<Utc>) -> Result<ItemTransition, MarketplaceDbError> {
        let mut tx = self.pool.begin().await?;
        let item = items::update_item_status(item_id, ItemStatus::Shipped, ItemStatus::Delivered, now, &mut tx).await?;
        items::record_delivery(item_id, now, &mut tx).await?;
        let ledger_entry = escrow::release(&item, "Delivery confirmed", now, &mut tx).await?;
        let item = Self::require_item(item_id, &mut tx).await?;
        let order = orders::sync_order_status(item.order_id, now, &mut tx).await?;
        tx.commit().await?;
        Ok(ItemTransition { item, order, ledger_entry })
    }

    async fn claim_items_for_refund(
        &self,
        order_id: i64,
        to_claim: &[CancelledItem],
        claim: &str,
    ) -> Result<(), MarketplaceDbError> {
        let mut tx = self.pool.begin().await?;
        for c in to_claim {
            items::claim_for_refund(c.item_id, order_id, c.expected_status, claim, &mut tx).await?;
        }
        tx.commit().await?;
        debug!("🗃️ {} item(s) of order #{order_id} claimed for refund {claim}", to_claim.len());
        Ok(())
    }

    async fn release_refund_claim(&self, claim: &str) -> Result<u64, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        let released = items::release_refund_claim(claim, &mut conn).await?;
        debug!("🗃️ Refund claim {claim} dropped from {released} item(s)");
        Ok(released)
    }

    async fn cancel_items(
        &self,
        order_id: i64,
        to_cancel: &[CancelledItem],
        claim: &str,
        refund_ref: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(OrderDetails, Vec<EscrowRelease>), MarketplaceDbError> {
        let mut tx = self.pool.begin().await?;
        let mut entries = Vec::with_capacity(to_cancel.len());
        for c in to_cancel {
            let item = items::cancel_claimed_item(c.item_id, claim, now, &mut tx).await?;
            if item.order_id != order_id {
                return Err(MarketplaceDbError::ConcurrencyConflict(format!(
                    "Order item #{} does not belong to order #{order_id}",
                    item.id
                )));
            }
            if let Some(entry) = escrow::refund(&item, reason, Some(refund_ref), now, &mut tx).await? {
                entries.push(entry);
            }
            catalog::set_product_status(item.product_id, ProductStatus::Active, &mut tx).await?;
        }
        let order = orders::sync_order_status(order_id, now, &mut tx).await?;
        let items = items::fetch_details_for_order(order_id, &mut tx).await?;
        tx.commit().await?;
        Ok((OrderDetails { order, items }, entries))
    }

    async fn release_escrow(
        &self,
        item_id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EscrowRelease>, MarketplaceDbError> {
        let mut tx = self.pool.begin().await?;
        let item = Self::require_item(item_id, &mut tx).await?;
        let entry = escrow::release(&item, reason, now, &mut tx).await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn refund_escrow(
        &self,
        item_id: i64,
        reason: &str,
        external_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<EscrowRelease>, MarketplaceDbError> {
        let mut tx = self.pool.begin().await?;
        let item = Self::require_item(item_id, &mut tx).await?;
        let entry = escrow::refund(&item, reason, external_ref, now, &mut tx).await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn record_transfer(
        &self,
        item_id: i64,
        transfer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EscrowRelease, MarketplaceDbError> {
        let mut tx = self.pool.begin().await?;
        let item = Self::require_item(item_id, &mut tx).await?;
        let entry = escrow::record_transfer(&item, transfer_id, now, &mut tx).await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn record_transfer_failure(
        &self,
        item_id: i64,
        expected: EscrowStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<EscrowRelease, MarketplaceDbError> {
        let mut tx = self.pool.begin().await?;
        let item = Self::require_item(item_id, &mut tx).await?;
        if item.escrow_status != expected {
            return Err(MarketplaceDbError::ConcurrencyConflict(format!(
                "Escrow for order item #{item_id} was expected to be {expected}, but is {}",
                item.escrow_status
            )));
        }
        let entry = escrow::record_transfer_failure(&item, reason, now, &mut tx).await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn fetch_ledger(&self, item_id: i64) -> Result<Vec<EscrowRelease>, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        escrow::fetch_ledger(item_id, &mut conn).await
    }

    async fn ledger_has_reference(&self, item_id: i64, external_ref: &str) -> Result<bool, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        escrow::ledger_has_reference(item_id, external_ref, &mut conn).await
    }

    async fn mark_disputed(&self, charge_id: &str) -> Result<u64, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        items::mark_disputed(charge_id, &mut conn).await
    }

    async fn is_webhook_processed(&self, provider: PaymentMethod, event_id: &str) -> Result<bool, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        webhooks::is_processed(provider, event_id, &mut conn).await
    }

    async fn mark_webhook_processed(
        &self,
        provider: PaymentMethod,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        webhooks::mark_processed(provider, event_id, event_type, now, &mut conn).await
    }

    async fn close(&mut self) -> Result<(), MarketplaceDbError> {
        self.pool.close().await;
        Ok(())
    }
}

impl CatalogManagement for SqliteDatabase {
    async fn fetch_product(&self, product_id: i64) -> Result<Option<Product>, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        catalog::fetch_product(product_id, &mut conn).await
    }

    async fn fetch_accepted_offer(&self, product_id: i64, buyer_id: i64) -> Result<Option<Offer>, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        catalog::fetch_accepted_offer(product_id, buyer_id, &mut conn).await
    }

    async fn insert_product(&self, seller_id: i64, title: &str, price: Money) -> Result<Product, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        catalog::insert_product(seller_id, title, price, &mut conn).await
    }

    async fn insert_offer(
        &self,
        product_id: i64,
        buyer_id: i64,
        price: Money,
        accepted: bool,
    ) -> Result<Offer, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        let status = if accepted { OfferStatus::Accepted } else { OfferStatus::Pending };
        catalog::insert_offer(product_id, buyer_id, price, status, &mut conn).await
    }
}

impl ProfileManagement for SqliteDatabase {
    async fn fetch_seller_profile(&self, user_id: i64) -> Result<Option<SellerProfile>, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        profiles::fetch_seller_profile(user_id, &mut conn).await
    }

    async fn fetch_address(&self, address_id: i64) -> Result<Option<Address>, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        profiles::fetch_address(address_id, &mut conn).await
    }

    async fn upsert_seller_profile(&self, profile: &SellerProfile) -> Result<SellerProfile, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        profiles::upsert_seller_profile(profile, &mut conn).await
    }

    async fn insert_address(&self, user_id: i64, formatted: &str) -> Result<Address, MarketplaceDbError> {
        let mut conn = self.pool.acquire().await?;
        profiles::insert_address(user_id, formatted, &mut conn).await
    }
}
