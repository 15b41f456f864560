use serde::{Deserialize, Serialize};

use crate::db_types::{EscrowRelease, Order};

/// Emitted once per order, when the payment has been confirmed and the items move to `Processing`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPaidEvent {
    pub order: Order,
}

impl OrderPaidEvent {
    pub fn new(order: Order) -> Self {
        Self { order }
    }
}

/// Emitted when items of an order are cancelled and refunded. `order` reflects the state after the cancellation, so
/// the order itself may still be live if only some items were cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAnnulledEvent {
    pub order: Order,
    pub cancelled_items: Vec<i64>,
}

impl OrderAnnulledEvent {
    pub fn new(order: Order, cancelled_items: Vec<i64>) -> Self {
        Self { order, cancelled_items }
    }
}

/// Emitted for every entry written to the escrow ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowMovedEvent {
    pub entry: EscrowRelease,
}

impl EscrowMovedEvent {
    pub fn new(entry: EscrowRelease) -> Self {
        Self { entry }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    OrderPaid(OrderPaidEvent),
    OrderAnnulled(OrderAnnulledEvent),
    EscrowMoved(EscrowMovedEvent),
}
