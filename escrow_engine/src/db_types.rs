use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use market_common::{FeeRate, Money};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("Invalid value: {0}")]
pub struct ConversionError(String);

/// Generates `Display` and `FromStr` for the unit enums stored as TEXT, so that the string form always matches what
/// sqlx writes to the database.
macro_rules! text_enum {
    ($name:ident { $($variant:ident),+ $(,)? }) => {
        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$variant => write!(f, stringify!($variant)),)+
                }
            }
        }

        impl FromStr for $name {
            type Err = ConversionError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $(stringify!($variant) => Ok(Self::$variant),)+
                    s => Err(ConversionError(format!("{s} is not a valid {}", stringify!($name)))),
                }
            }
        }
    };
}

//--------------------------------------   PaymentMethod     ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
pub enum PaymentMethod {
    /// Card payments through a payment-intent style processor.
    Card,
    /// Bank transfers initiated by scanning a QR code or following a payment link.
    QrTransfer,
}

text_enum!(PaymentMethod { Card, QrTransfer });

impl PaymentMethod {
    /// The short name used in webhook URLs and in the processed-webhook table.
    pub fn slug(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::QrTransfer => "qr",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug.to_ascii_lowercase().as_str() {
            "card" => Some(Self::Card),
            "qr" | "qr_transfer" => Some(Self::QrTransfer),
            _ => None,
        }
    }
}

//--------------------------------------   OrderStatusType   ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
pub enum OrderStatusType {
    /// The order has been created and the charge opened, but payment has not been confirmed.
    Pending,
    /// Payment has been confirmed and the sellers are preparing the items.
    Processing,
    /// At least one item is on its way.
    Shipped,
    /// Every item that was not cancelled has been delivered.
    Delivered,
    /// Every item was cancelled.
    Cancelled,
}

text_enum!(OrderStatusType { Pending, Processing, Shipped, Delivered, Cancelled });

//--------------------------------------     ItemStatus      ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
pub enum ItemStatus {
    Pending,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

text_enum!(ItemStatus { Pending, Processing, Shipped, Delivered, Cancelled });

impl ItemStatus {
    /// The item lifecycle only moves forward: `Pending → Processing → Shipped → Delivered`, and cancellation is only
    /// possible before the item ships.
    pub fn can_transition_to(&self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) |
                (Processing, Shipped) |
                (Shipped, Delivered) |
                (Pending, Cancelled) |
                (Processing, Cancelled)
        )
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, ItemStatus::Pending | ItemStatus::Processing)
    }

    pub fn has_shipped(&self) -> bool {
        matches!(self, ItemStatus::Shipped | ItemStatus::Delivered)
    }
}

/// Derives the aggregate order status from the statuses of its items. The first matching rule wins:
/// 1. every item cancelled: `Cancelled`
/// 2. every item delivered or cancelled, with at least one delivered: `Delivered`
/// 3. any item shipped or delivered: `Shipped`
/// 4. any item processing: `Processing`
/// 5. otherwise `Pending`
pub fn derive_order_status(items: &[ItemStatus]) -> OrderStatusType {
    if items.is_empty() {
        return OrderStatusType::Pending;
    }
    if items.iter().all(|s| *s == ItemStatus::Cancelled) {
        return OrderStatusType::Cancelled;
    }
    if items.iter().all(|s| matches!(s, ItemStatus::Delivered | ItemStatus::Cancelled)) {
        return OrderStatusType::Delivered;
    }
    if items.iter().any(ItemStatus::has_shipped) {
        return OrderStatusType::Shipped;
    }
    if items.iter().any(|s| *s == ItemStatus::Processing) {
        return OrderStatusType::Processing;
    }
    OrderStatusType::Pending
}

//--------------------------------------    EscrowStatus     ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
pub enum EscrowStatus {
    /// Funds have been captured and are held by the platform.
    Holding,
    /// Delivery was confirmed. The seller's share is owed but has not been paid out yet.
    Released,
    /// The seller's share was paid out.
    Transferred,
    /// The buyer was refunded in full.
    Refunded,
    /// The payout was attempted and failed. Requires an operator retry.
    TransferFailed,
}

text_enum!(EscrowStatus { Holding, Released, Transferred, Refunded, TransferFailed });

impl EscrowStatus {
    pub fn can_transition_to(&self, next: EscrowStatus) -> bool {
        use EscrowStatus::*;
        matches!(
            (self, next),
            (Holding, Released) |
                (Holding, Refunded) |
                (Released, Transferred) |
                (Released, TransferFailed) |
                (TransferFailed, Transferred)
        )
    }

    /// True once the seller's share has been released, whether or not it has been paid out.
    pub fn is_released(&self) -> bool {
        matches!(self, EscrowStatus::Released | EscrowStatus::Transferred | EscrowStatus::TransferFailed)
    }
}

//--------------------------------------    DisputeStatus    ---------------------------------------------------------
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Type, Serialize, Deserialize)]
pub enum DisputeStatus {
    #[default]
    Clear,
    Open,
    Resolved,
}

text_enum!(DisputeStatus { Clear, Open, Resolved });

//--------------------------------------   LedgerDirection   ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
pub enum LedgerDirection {
    ToSeller,
    ToBuyer,
}

text_enum!(LedgerDirection { ToSeller, ToBuyer });

//--------------------------------------   EscrowMovement    ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
pub enum EscrowMovement {
    Release,
    Refund,
    Transfer,
    TransferFailure,
}

text_enum!(EscrowMovement { Release, Refund, Transfer, TransferFailure });

//--------------------------------------   ProductStatus     ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
pub enum ProductStatus {
    Active,
    Sold,
    Inactive,
}

text_enum!(ProductStatus { Active, Sold, Inactive });

//--------------------------------------    OfferStatus      ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
}

text_enum!(OfferStatus { Pending, Accepted, Rejected });

//--------------------------------------        Order        ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    /// The reference sent to the payment provider. A UUID, unique across all orders.
    pub order_ref: String,
    pub buyer_id: i64,
    pub shipping_address_id: i64,
    pub payment_method: PaymentMethod,
    pub total_amount: Money,
    pub status: OrderStatusType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

//--------------------------------------      OrderItem      ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub seller_id: i64,
    pub price: Money,
    pub platform_fee: Money,
    pub fee_rate: FeeRate,
    pub status: ItemStatus,
    pub escrow_status: EscrowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderItem {
    /// The amount owed to the seller once the platform fee is deducted.
    pub fn seller_payout(&self) -> Money {
        self.price - self.platform_fee
    }
}

//--------------------------------------     Transaction     ---------------------------------------------------------
/// The payment-facing record of a single order item.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub order_item_id: i64,
    pub charge_id: String,
    pub gateway_order_code: String,
    pub amount: Money,
    pub platform_fee: Money,
    pub fee_rate: FeeRate,
    pub shipping_snapshot: String,
    pub tracking_number: Option<String>,
    pub dispute_status: DisputeStatus,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

//--------------------------------------    EscrowRelease    ---------------------------------------------------------
/// An entry in the append-only escrow ledger.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct EscrowRelease {
    pub id: i64,
    pub order_item_id: i64,
    pub amount: Money,
    pub direction: LedgerDirection,
    pub movement: EscrowMovement,
    pub reason: String,
    pub external_ref: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub order_item_id: i64,
    pub amount: Money,
    pub direction: LedgerDirection,
    pub movement: EscrowMovement,
    pub reason: String,
    pub external_ref: Option<String>,
}

//--------------------------------------       FeeTier       ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct FeeTier {
    pub id: i64,
    pub min_amount: Money,
    /// Exclusive upper bound. `None` means the tier is open-ended.
    pub max_amount: Option<Money>,
    pub base_rate: FeeRate,
    pub legit_discount: Option<FeeRate>,
    pub membership_discount: Option<FeeRate>,
}

impl FeeTier {
    pub fn contains(&self, amount: Money) -> bool {
        amount >= self.min_amount && self.max_amount.map(|max| amount < max).unwrap_or(true)
    }
}

//--------------------------------------  Collaborator data  ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub seller_id: i64,
    pub title: String,
    pub price: Money,
    pub status: ProductStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct SellerProfile {
    pub user_id: i64,
    /// The provider-side account that payouts are sent to.
    pub payout_destination: Option<String>,
    pub payout_enabled: bool,
    /// The seller has passed the platform's identity check ("legit profile").
    pub legit_verified: bool,
    pub membership_active: bool,
    pub completed_transactions: i64,
}

impl SellerProfile {
    /// A seller can only receive orders if they can also be paid.
    pub fn can_receive_payouts(&self) -> bool {
        self.payout_enabled && self.payout_destination.as_ref().map(|d| !d.trim().is_empty()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Address {
    pub id: i64,
    pub user_id: i64,
    pub formatted: String,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Offer {
    pub id: i64,
    pub product_id: i64,
    pub buyer_id: i64,
    pub price: Money,
    pub status: OfferStatus,
}

//--------------------------------------      OrderDraft     ---------------------------------------------------------
/// A single line of a new order, fully priced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLineItem {
    pub product_id: i64,
    pub seller_id: i64,
    pub price: Money,
    pub platform_fee: Money,
    pub fee_rate: FeeRate,
}

/// A validated, priced order that has not been persisted yet.
///
/// The total is always derived from the lines, so an order built from a draft satisfies
/// `total_amount == Σ item.price` by construction. Drafts cannot be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderDraft {
    order_ref: String,
    buyer_id: i64,
    shipping_address_id: i64,
    shipping_snapshot: String,
    payment_method: PaymentMethod,
    lines: Vec<NewLineItem>,
}

impl OrderDraft {
    pub fn new(
        order_ref: String,
        buyer_id: i64,
        shipping_address: &Address,
        payment_method: PaymentMethod,
        lines: Vec<NewLineItem>,
    ) -> Option<Self> {
        if lines.is_empty() {
            return None;
        }
        Some(Self {
            order_ref,
            buyer_id,
            shipping_address_id: shipping_address.id,
            shipping_snapshot: shipping_address.formatted.clone(),
            payment_method,
            lines,
        })
    }

    pub fn order_ref(&self) -> &str {
        &self.order_ref
    }

    pub fn buyer_id(&self) -> i64 {
        self.buyer_id
    }

    pub fn shipping_address_id(&self) -> i64 {
        self.shipping_address_id
    }

    pub fn shipping_snapshot(&self) -> &str {
        &self.shipping_snapshot
    }

    pub fn payment_method(&self) -> PaymentMethod {
        self.payment_method
    }

    pub fn lines(&self) -> &[NewLineItem] {
        &self.lines
    }

    pub fn total_amount(&self) -> Money {
        self.lines.iter().map(|l| l.price).sum()
    }
}
