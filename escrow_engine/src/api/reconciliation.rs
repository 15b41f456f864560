//! Periodic reconciliation.
//!
//! Two sweeps run on every tick:
//! * Orders stuck in `Pending` for longer than `stuck_payment_after` are checked with the provider. Those that turn
//!   out to be paid are confirmed exactly as if the buyer had confirmed them.
//! * Released items whose holding period has elapsed are paid out to their sellers.
//!
//! A failure on one record is logged and counted, and never stops the rest of the sweep.
use std::fmt::Display;

use chrono::{DateTime, Duration, Utc};
use log::*;
use serde::{Deserialize, Serialize};

use crate::{
    api::{
        errors::OrderFlowError,
        escrow_api::{EscrowApi, TransferOutcome, DEFAULT_HOLDING_PERIOD_DAYS},
        order_flow_api::OrderFlowApi,
        order_objects::{Actor, PaymentProof},
    },
    db_types::{Order, OrderStatusType},
    gateway::{GatewayRegistry, PaymentGateway},
    traits::MarketplaceDatabase,
};

pub const DEFAULT_STUCK_PAYMENT_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationConfig {
    /// How long an order may stay `Pending` before the provider is asked about it.
    pub stuck_payment_after: Duration,
    /// How long released funds are held before payout.
    pub holding_period: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            stuck_payment_after: Duration::minutes(DEFAULT_STUCK_PAYMENT_MINUTES),
            holding_period: Duration::days(DEFAULT_HOLDING_PERIOD_DAYS),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub advanced: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// Set if the sweep could not even list its candidates.
    pub aborted: Option<String>,
}

impl SweepReport {
    fn aborted(reason: String) -> Self {
        Self { aborted: Some(reason), ..Default::default() }
    }
}

impl Display for SweepReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.aborted {
            Some(reason) => write!(f, "aborted ({reason})"),
            None => write!(
                f,
                "{} examined, {} advanced, {} unchanged, {} failed",
                self.examined, self.advanced, self.unchanged, self.failed
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub payments: SweepReport,
    pub transfers: SweepReport,
}

#[derive(Clone)]
pub struct ReconciliationScheduler<B, G> {
    db: B,
    gateways: G,
    orders: OrderFlowApi<B, G>,
    escrow: EscrowApi<B, G>,
    config: ReconciliationConfig,
}

impl<B, G> std::fmt::Debug for ReconciliationScheduler<B, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReconciliationScheduler({:?})", self.config)
    }
}

impl<B, G> ReconciliationScheduler<B, G>
where
    B: MarketplaceDatabase,
    G: GatewayRegistry,
{
    pub fn new(orders: OrderFlowApi<B, G>, escrow: EscrowApi<B, G>, config: ReconciliationConfig) -> Self {
        let db = orders.db().clone();
        let gateways = orders.gateways().clone();
        let escrow = escrow.with_holding_period(config.holding_period);
        Self { db, gateways, orders, escrow, config }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    /// Runs both sweeps as of `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let payments = self.sweep_stuck_payments(now).await;
        let transfers = self.sweep_due_transfers(now).await;
        info!("🕰️ Reconciliation at {now}. Payments: {payments}. Transfers: {transfers}.");
        TickReport { payments, transfers }
    }

    pub async fn sweep_stuck_payments(&self, now: DateTime<Utc>) -> SweepReport {
        let cutoff = now - self.config.stuck_payment_after;
        let orders = match self.db.fetch_pending_orders_created_before(cutoff).await {
            Ok(orders) => orders,
            Err(e) => {
                error!("🕰️ Could not fetch pending orders. {e}");
                return SweepReport::aborted(e.to_string());
            },
        };
        let mut report = SweepReport { examined: orders.len(), ..Default::default() };
        for order in orders {
            match self.reconcile_payment(&order).await {
                Ok(true) => report.advanced += 1,
                Ok(false) => report.unchanged += 1,
                Err(e) => {
                    warn!("🕰️ Could not reconcile payment for order #{}. {e}", order.id);
                    report.failed += 1;
                },
            }
        }
        report
    }

    async fn reconcile_payment(&self, order: &Order) -> Result<bool, OrderFlowError> {
        if order.status != OrderStatusType::Pending {
            return Ok(false);
        }
        let details = self
            .db
            .fetch_order_details(order.id)
            .await?
            .ok_or_else(|| OrderFlowError::not_found(format!("Order #{}", order.id)))?;
        let Some(charge_id) = details.charge_id() else {
            return Ok(false);
        };
        let gateway = self.gateways.gateway_for(order.payment_method)?;
        if !gateway.verify_payment(charge_id).await? {
            trace!("🕰️ Order #{} is still unpaid", order.id);
            return Ok(false);
        }
        let proof = PaymentProof { charge_id: charge_id.to_string() };
        self.orders.confirm_payment(order.id, Actor::System, proof).await?;
        info!("🕰️ Order #{} was paid but never confirmed. It has now been confirmed.", order.id);
        Ok(true)
    }

    pub async fn sweep_due_transfers(&self, now: DateTime<Utc>) -> SweepReport {
        let cutoff = now - self.config.holding_period;
        let items = match self.db.fetch_released_items_delivered_before(cutoff).await {
            Ok(items) => items,
            Err(e) => {
                error!("🕰️ Could not fetch items due for payout. {e}");
                return SweepReport::aborted(e.to_string());
            },
        };
        let mut report = SweepReport { examined: items.len(), ..Default::default() };
        for details in items {
            let item_id = details.item.id;
            match self.escrow.scheduled_transfer(item_id, now).await {
                Ok(TransferOutcome::Transferred(_)) => report.advanced += 1,
                Ok(TransferOutcome::Failed(_)) => report.failed += 1,
                Ok(TransferOutcome::NotDue { .. } | TransferOutcome::NotEligible(_)) => report.unchanged += 1,
                Err(e) => {
                    warn!("🕰️ Could not pay out order item #{item_id}. {e}");
                    report.failed += 1;
                },
            }
        }
        report
    }
}
