//! # Marketplace escrow server
//! This crate hosts the HTTP front end for the order and escrow engine. It is responsible for:
//! * Accepting order, payment and item status requests from the marketplace front end.
//! * Receiving payment provider webhooks and handing them to the engine.
//! * Running the reconciliation worker, which confirms stuck payments and pays sellers out once escrow is due.
//!
//! ## Configuration
//! The server is configured via environment variables. See [config](config/index.html) for more information.
//!
//! ## Routes
//! The server exposes the following routes:
//! * `/health`: A health check route that returns a 200 OK response.
//! * `/api/orders`, `/api/orders/{id}`, `/api/orders/{id}/confirm_payment`, `/api/orders/{id}/cancel`: order
//!   lifecycle.
//! * `/api/items/{id}/status`: ship, deliver or cancel a single item.
//! * `/api/items/{id}/ledger`, `/api/items/{id}/retry_transfer`: operator-only escrow routes.
//! * `/webhook/{provider}`: provider notifications, where `provider` is `card` or `qr`.
pub mod auth;
pub mod cli;
pub mod config;
pub mod errors;
pub mod integrations;
pub mod reconciliation_worker;
pub mod routes;
pub mod server;

#[cfg(test)]
mod endpoint_tests;
