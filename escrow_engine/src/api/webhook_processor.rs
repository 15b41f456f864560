//! Provider notifications.
//!
//! A webhook is authenticated and decoded by the provider's gateway into a [`CanonicalEvent`], then applied through
//! the same APIs that serve interactive requests. An event is only marked as processed once it has been applied, so a
//! failure leaves it to be redelivered. Redeliveries of an applied event are acknowledged without side effects.
use std::fmt::Display;

use chrono::{DateTime, Utc};
use log::*;
use serde::{Deserialize, Serialize};

use crate::{
    api::{
        errors::OrderFlowError,
        escrow_api::EscrowApi,
        order_flow_api::OrderFlowApi,
        order_objects::{Actor, PaymentProof},
    },
    db_types::{OrderStatusType, PaymentMethod},
    gateway::{CanonicalEvent, GatewayError, GatewayRegistry, PaymentGateway},
    traits::MarketplaceDatabase,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookOutcome {
    /// The event changed local state.
    Applied(String),
    /// The event was processed before.
    Duplicate,
    /// The event is authentic but there is nothing to do for it.
    Ignored(String),
}

impl Display for WebhookOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookOutcome::Applied(s) => write!(f, "applied: {s}"),
            WebhookOutcome::Duplicate => write!(f, "duplicate"),
            WebhookOutcome::Ignored(s) => write!(f, "ignored: {s}"),
        }
    }
}

#[derive(Clone)]
pub struct WebhookProcessor<B, G> {
    db: B,
    gateways: G,
    orders: OrderFlowApi<B, G>,
    escrow: EscrowApi<B, G>,
}

impl<B, G> std::fmt::Debug for WebhookProcessor<B, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WebhookProcessor")
    }
}

impl<B, G> WebhookProcessor<B, G>
where
    B: MarketplaceDatabase,
    G: GatewayRegistry,
{
    pub fn new(orders: OrderFlowApi<B, G>, escrow: EscrowApi<B, G>) -> Self {
        let db = orders.db().clone();
        let gateways = orders.gateways().clone();
        Self { db, gateways, orders, escrow }
    }

    /// Authenticates, decodes and applies a webhook from `provider`.
    ///
    /// Returns `Gateway(InvalidSignature)` for payloads that fail authentication. Event types the engine does not act
    /// on are acknowledged as [`WebhookOutcome::Ignored`] so that the provider stops sending them.
    pub async fn process(
        &self,
        provider: PaymentMethod,
        payload: &[u8],
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, OrderFlowError> {
        let gateway = self.gateways.gateway_for(provider)?;
        let event = match gateway.decode_webhook(payload, signature, now) {
            Ok(event) => event,
            Err(GatewayError::UnsupportedEvent(kind)) => {
                debug!("🪝️ Ignoring {provider} webhook of type {kind}");
                return Ok(WebhookOutcome::Ignored(format!("unsupported event type {kind}")));
            },
            Err(e) => {
                warn!("🪝️ Rejected {provider} webhook. {e}");
                return Err(e.into());
            },
        };
        let event_id = event.event_id().to_string();
        if self.db.is_webhook_processed(provider, &event_id).await? {
            info!("🪝️ {provider} event {event_id} has already been processed");
            return Ok(WebhookOutcome::Duplicate);
        }
        let outcome = self.apply(&event).await?;
        if !self.db.mark_webhook_processed(provider, &event_id, event.kind(), now).await? {
            // Another delivery of the same event got there first. Everything it does is idempotent.
            debug!("🪝️ {provider} event {event_id} was processed concurrently");
        }
        info!("🪝️ {provider} event {event_id} ({}): {outcome}", event.kind());
        Ok(outcome)
    }

    async fn apply(&self, event: &CanonicalEvent) -> Result<WebhookOutcome, OrderFlowError> {
        match event {
            CanonicalEvent::PaymentSucceeded { charge_id, .. } => self.payment_succeeded(charge_id).await,
            CanonicalEvent::PaymentFailed { charge_id, reason, .. } => {
                let reason = reason.as_deref().unwrap_or("no reason given");
                info!("🪝️ Payment for charge {charge_id} failed: {reason}. Orders stay pending.");
                Ok(WebhookOutcome::Ignored(format!("payment failed: {reason}")))
            },
            CanonicalEvent::DisputeOpened { charge_id, .. } => {
                let n = self.db.mark_disputed(charge_id).await?;
                warn!("🪝️ Dispute opened on charge {charge_id}. {n} transactions flagged.");
                Ok(WebhookOutcome::Applied(format!("{n} transactions disputed")))
            },
            CanonicalEvent::TransferCreated { transfer_id, order_item_id, .. } => {
                match self.escrow.confirm_transfer(*order_item_id, transfer_id).await? {
                    Some(_) => Ok(WebhookOutcome::Applied(format!("order item #{order_item_id} transferred"))),
                    None => Ok(WebhookOutcome::Ignored(format!("transfer {transfer_id} already recorded"))),
                }
            },
            CanonicalEvent::TransferFailed { transfer_id, order_item_id, reason, .. } => {
                let reason = reason.clone().unwrap_or_else(|| format!("Provider reported transfer {transfer_id} failed"));
                match self.escrow.report_transfer_failure(*order_item_id, &reason).await? {
                    Some(_) => Ok(WebhookOutcome::Applied(format!("order item #{order_item_id} transfer failed"))),
                    None => Ok(WebhookOutcome::Ignored(format!("order item #{order_item_id} is not awaiting payout"))),
                }
            },
        }
    }

    async fn payment_succeeded(&self, charge_id: &str) -> Result<WebhookOutcome, OrderFlowError> {
        let orders = self.db.fetch_orders_for_charge(charge_id).await?;
        if orders.is_empty() {
            return Ok(WebhookOutcome::Ignored(format!("no order uses charge {charge_id}")));
        }
        let mut confirmed = Vec::new();
        for order in orders.iter().filter(|o| o.status == OrderStatusType::Pending) {
            let proof = PaymentProof { charge_id: charge_id.to_string() };
            self.orders.confirm_payment(order.id, Actor::System, proof).await?;
            confirmed.push(order.id.to_string());
        }
        if confirmed.is_empty() {
            Ok(WebhookOutcome::Ignored(format!("orders for charge {charge_id} are already past payment")))
        } else {
            Ok(WebhookOutcome::Applied(format!("order #{} paid", confirmed.join(", #"))))
        }
    }
}
