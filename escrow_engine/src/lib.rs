//! Marketplace Order & Escrow Engine
//!
//! This library contains the core logic of a peer-to-peer marketplace's order lifecycle. A buyer's order may contain
//! items from several sellers. Each item carries its own status, its own escrow position and its own platform fee, and
//! the order's status is derived from its items.
//!
//! The library is divided into these sections:
//! 1. Storage ([`mod@traits`] and, with the `sqlite` feature, [`SqliteDatabase`]). The traits define what a backend
//!    must provide. You should not need to touch the database directly; use the public API instead. The exception is
//!    the data types, which live in [`mod@db_types`].
//! 2. Payment providers ([`mod@gateway`]). Charges, refunds and payouts go through the [`gateway::PaymentGateway`]
//!    trait, and signed provider webhooks are decoded into provider-independent events.
//! 3. Fees ([`mod@fees`]). The tiered platform fee schedule with seller discounts.
//! 4. The public API ([`mod@api`]): order orchestration, escrow, webhook processing and reconciliation.
//!
//! The engine also emits events (an order was paid, items were cancelled, funds moved in escrow) that the host
//! application can hook into. See [`mod@events`].
pub mod api;
pub mod db_types;
pub mod events;
pub mod fees;
pub mod gateway;
pub mod traits;

#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(any(feature = "test_utils", test))]
pub mod test_utils;

pub use api::{
    order_objects,
    EscrowApi,
    OrderFlowApi,
    OrderFlowError,
    ReconciliationConfig,
    ReconciliationScheduler,
    TransferOutcome,
    WebhookOutcome,
    WebhookProcessor,
};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDatabase;
pub use traits::{MarketplaceDatabase, MarketplaceDbError};
