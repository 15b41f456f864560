use serde::{Deserialize, Serialize};

use crate::db_types::{EscrowRelease, ItemStatus, Order, OrderItem, Transaction};

/// An order item together with its transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDetails {
    pub item: OrderItem,
    pub transaction: Transaction,
}

/// An order with all of its items and transactions loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDetails {
    pub order: Order,
    pub items: Vec<ItemDetails>,
}

impl OrderDetails {
    pub fn item(&self, item_id: i64) -> Option<&ItemDetails> {
        self.items.iter().find(|i| i.item.id == item_id)
    }

    pub fn item_statuses(&self) -> Vec<ItemStatus> {
        self.items.iter().map(|i| i.item.status).collect()
    }

    /// The provider charge backing this order. Every transaction of an order shares the same charge.
    pub fn charge_id(&self) -> Option<&str> {
        self.items.first().map(|i| i.transaction.charge_id.as_str())
    }

    pub fn involves_seller(&self, seller_id: i64) -> bool {
        self.items.iter().any(|i| i.item.seller_id == seller_id)
    }
}

/// The result of moving a single item to a new status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemTransition {
    pub item: OrderItem,
    pub order: Order,
    /// Set when the transition moved funds in the escrow ledger.
    pub ledger_entry: Option<EscrowRelease>,
}

/// The result of confirming payment for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPaid {
    pub order: Order,
    pub items: Vec<OrderItem>,
}

/// An item to cancel, along with the status the caller last saw it in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledItem {
    pub item_id: i64,
    pub expected_status: ItemStatus,
}
