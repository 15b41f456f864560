//! # Database backends
//!
//! This module defines the contracts that a storage backend must fulfil to drive the order and escrow engine.
//!
//! * [`MarketplaceDatabase`] is the highest level of behaviour. Every method that changes money-affecting state is a
//!   single atomic unit of work. Status changes are conditional on the status the caller observed, and a lost race is
//!   reported as [`MarketplaceDbError::ConcurrencyConflict`] rather than silently overwritten.
//! * [`CatalogManagement`] gives the engine its narrow view of the product catalog and accepted offers.
//! * [`ProfileManagement`] gives the engine its narrow view of seller profiles and buyer addresses.
//!
//! Catalog and profile data belong to other parts of the marketplace. The engine reads them, and only ever writes a
//! product's status and a seller's completed-transaction counter.
mod collaborators;
mod data_objects;
mod marketplace_database;

pub use collaborators::{CatalogManagement, ProfileManagement};
pub use data_objects::{CancelledItem, ItemDetails, ItemTransition, OrderDetails, OrderPaid};
pub use marketplace_database::{MarketplaceDatabase, MarketplaceDbError};
