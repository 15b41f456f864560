//! # Payment gateway adapter
//!
//! The engine talks to external payment processors through the [`PaymentGateway`] trait. It is a capability set:
//! open a charge, verify it, refund it, pay a seller out, and decode a signed webhook into a [`CanonicalEvent`].
//!
//! Two providers are included: [`CardGateway`] for payment-intent style card processors, and [`QrTransferGateway`]
//! for payment-link / QR bank transfer processors. The provider for an order is chosen by its payment method through
//! a [`GatewayRegistry`].
//!
//! None of the providers retry. Every request has a bounded timeout, and a failure is returned to the caller, who
//! decides what happens to local state. Refunds and payouts carry an idempotency key derived from what they pay for,
//! so a request repeated after a timeout or a lost response moves the money once.
mod card;
mod errors;
mod events;
mod qr_transfer;
mod registry;
mod rest;
pub mod signature;

pub use card::{CardGateway, CardGatewayConfig};
use chrono::{DateTime, Utc};
pub use errors::GatewayError;
pub use events::CanonicalEvent;
use market_common::Money;
pub use qr_transfer::{QrTransferGateway, QrTransferGatewayConfig};
pub use registry::{GatewayRegistry, Provider, ProviderRegistry};
use serde::{Deserialize, Serialize};

use crate::db_types::PaymentMethod;

/// The result of opening a charge with a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeHandle {
    /// The provider's identifier for the charge. Recorded on every transaction of the order.
    pub charge_id: String,
    /// Whatever the client needs to complete payment: a client secret, a checkout URL or a QR payload.
    pub redirect: String,
}

/// Context sent along with a payout, so that payout webhooks can be traced back to the order item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub order_item_id: i64,
    pub order_ref: String,
}

impl TransferMetadata {
    /// Every payout attempt for an item carries the same key.
    pub fn idempotency_key(&self) -> String {
        format!("payout:{}:{}", self.order_item_id, self.order_ref)
    }
}

#[allow(async_fn_in_trait)]
pub trait PaymentGateway {
    fn method(&self) -> PaymentMethod;

    /// Opens a charge for `amount`, tagged with the order reference.
    async fn create_charge(&self, amount: Money, order_ref: &str) -> Result<ChargeHandle, GatewayError>;

    /// Asks the provider whether the charge has been paid. This is the source of truth for payment state.
    async fn verify_payment(&self, charge_id: &str) -> Result<bool, GatewayError>;

    /// Refunds `amount` of the given charge and returns the provider's refund id. Returns
    /// [`GatewayError::ChargeNotFound`] if the provider has no such charge. A repeated call with the same
    /// `idempotency_key` returns the original refund rather than issuing another.
    async fn refund(&self, charge_id: &str, amount: Money, idempotency_key: &str) -> Result<String, GatewayError>;

    /// Pays `amount` out to the seller's `destination` account and returns the provider's transfer id. Payouts are keyed
    /// on [`TransferMetadata::idempotency_key`].
    async fn transfer_to_seller(
        &self,
        destination: &str,
        amount: Money,
        metadata: &TransferMetadata,
    ) -> Result<String, GatewayError>;

    /// Verifies the webhook signature and decodes the payload. Nothing in the payload is trusted before the signature
    /// checks out. Providers that sign a timestamp reject signatures too far from `now`.
    fn decode_webhook(
        &self,
        payload: &[u8],
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<CanonicalEvent, GatewayError>;
}
