//! The public face of the engine.
//!
//! * [`OrderFlowApi`] creates orders, confirms payments and applies status changes requested by users and operators.
//! * [`EscrowApi`] moves funds through the escrow ledger and pays sellers out.
//! * [`WebhookProcessor`] applies authenticated provider notifications.
//! * [`ReconciliationScheduler`] sweeps for payments that were never confirmed and payouts that have fallen due.
//!
//! All of them are generic over the storage backend ([`crate::traits::MarketplaceDatabase`]) and the set of payment
//! providers ([`crate::gateway::GatewayRegistry`]).
pub mod errors;
pub mod escrow_api;
pub mod order_flow_api;
pub mod order_objects;
pub mod reconciliation;
pub mod webhook_processor;

pub use errors::OrderFlowError;
pub use escrow_api::{EscrowApi, TransferOutcome};
pub use order_flow_api::OrderFlowApi;
pub use reconciliation::{ReconciliationConfig, ReconciliationScheduler, SweepReport, TickReport};
pub use webhook_processor::{WebhookOutcome, WebhookProcessor};
