use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{
    db_types::{ItemStatus, Order, PaymentMethod},
    traits::OrderDetails,
};

/// Who is asking for a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    /// A marketplace user. Whether they act as buyer or seller depends on the order.
    User(i64),
    /// A platform operator.
    Admin,
    /// The engine itself, acting on provider notifications or during reconciliation.
    System,
}

impl Actor {
    pub fn is_privileged(&self) -> bool {
        matches!(self, Actor::Admin | Actor::System)
    }

    pub fn is_user(&self, user_id: i64) -> bool {
        matches!(self, Actor::User(id) if *id == user_id)
    }
}

impl Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user #{id}"),
            Actor::Admin => write!(f, "admin"),
            Actor::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderRequest {
    pub shipping_address_id: i64,
    pub payment_method: PaymentMethod,
    pub product_ids: Vec<i64>,
}

/// Returned from order creation: the persisted order, and what the client needs to complete payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedOrder {
    pub details: OrderDetails,
    pub redirect: String,
}

impl CreatedOrder {
    pub fn order(&self) -> &Order {
        &self.details.order
    }
}

/// Evidence from the client that it has paid. The engine does not trust it: it is only used to pick the charge, which
/// is then verified with the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentProof {
    pub charge_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStatusUpdate {
    pub status: ItemStatus,
    #[serde(default)]
    pub tracking_number: Option<String>,
}

impl ItemStatusUpdate {
    pub fn new(status: ItemStatus) -> Self {
        Self { status, tracking_number: None }
    }

    pub fn with_tracking_number<S: Into<String>>(mut self, tracking_number: S) -> Self {
        self.tracking_number = Some(tracking_number.into());
        self
    }
}
