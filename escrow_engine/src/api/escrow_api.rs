use std::fmt::Debug;

use chrono::{DateTime, Duration, Utc};
use log::*;
use serde::{Deserialize, Serialize};

use crate::{
    api::errors::OrderFlowError,
    db_types::{EscrowRelease, EscrowStatus, ItemStatus},
    events::{EscrowMovedEvent, EventProducers},
    gateway::{GatewayRegistry, PaymentGateway, TransferMetadata},
    traits::{ItemDetails, MarketplaceDatabase},
};

/// How long released funds stay with the platform before they are paid out to the seller.
pub const DEFAULT_HOLDING_PERIOD_DAYS: i64 = 7;

/// What happened when a payout was due to be attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    /// The provider accepted the payout.
    Transferred(EscrowRelease),
    /// The provider refused the payout, or the seller had nowhere to receive it. The item is now `TransferFailed`.
    Failed(EscrowRelease),
    /// The holding period has not elapsed.
    NotDue { due_at: DateTime<Utc> },
    /// The item's escrow is not waiting for a payout.
    NotEligible(EscrowStatus),
}

/// `EscrowApi` owns the escrow state machine of each order item:
///
/// ```text
///   Holding ──► Released ──► Transferred
///      │            │             ▲
///      ▼            ▼             │ (operator retry)
///   Refunded    TransferFailed ───┘
/// ```
///
/// Release and refund are bookkeeping: they move funds between the platform's holding position and the parties in the
/// ledger. A transfer is an actual payout through the provider.
#[derive(Clone)]
pub struct EscrowApi<B, G> {
    db: B,
    gateways: G,
    producers: EventProducers,
    holding_period: Duration,
}

impl<B, G> Debug for EscrowApi<B, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EscrowApi(holding_period: {})", self.holding_period)
    }
}

impl<B, G> EscrowApi<B, G> {
    pub fn new(db: B, gateways: G, producers: EventProducers) -> Self {
        Self { db, gateways, producers, holding_period: Duration::days(DEFAULT_HOLDING_PERIOD_DAYS) }
    }

    pub fn with_holding_period(mut self, holding_period: Duration) -> Self {
        self.holding_period = holding_period;
        self
    }

    pub fn holding_period(&self) -> Duration {
        self.holding_period
    }
}

impl<B, G> EscrowApi<B, G>
where
    B: MarketplaceDatabase,
    G: GatewayRegistry,
{
    /// Releases the seller's share of a delivered item. Delivery confirmation already does this, so for most items
    /// this is a no-op returning `None`.
    pub async fn release(&self, item_id: i64, reason: &str) -> Result<Option<EscrowRelease>, OrderFlowError> {
        let details = self.fetch_item(item_id).await?;
        if details.item.status != ItemStatus::Delivered {
            return Err(OrderFlowError::rule(format!(
                "Escrow for order item #{item_id} can only be released once it is delivered. It is {}",
                details.item.status
            )));
        }
        let entry = self.db.release_escrow(item_id, reason, Utc::now()).await?;
        match &entry {
            Some(e) => {
                info!("🔒️ Released {} for order item #{item_id}", e.amount);
                self.producers.publish_escrow_moved(EscrowMovedEvent::new(e.clone())).await;
            },
            None => debug!("🔒️ Escrow for order item #{item_id} was already released"),
        }
        Ok(entry)
    }

    /// Records the return of a held item's price to the buyer. Only cancelled items can be refunded, and the money
    /// itself must already have been returned through the provider.
    pub async fn refund(
        &self,
        item_id: i64,
        reason: &str,
        refund_ref: Option<&str>,
    ) -> Result<Option<EscrowRelease>, OrderFlowError> {
        let details = self.fetch_item(item_id).await?;
        if details.item.status != ItemStatus::Cancelled {
            return Err(OrderFlowError::rule(format!(
                "Escrow for order item #{item_id} can only be refunded once it is cancelled. It is {}",
                details.item.status
            )));
        }
        let entry = self.db.refund_escrow(item_id, reason, refund_ref, Utc::now()).await?;
        if let Some(e) = &entry {
            info!("🔒️ Refunded {} to the buyer for order item #{item_id}", e.amount);
            self.producers.publish_escrow_moved(EscrowMovedEvent::new(e.clone())).await;
        }
        Ok(entry)
    }

    /// Pays out a released item once its holding period has passed.
    ///
    /// A provider failure is not an error here: it is recorded as `TransferFailed` and returned as
    /// [`TransferOutcome::Failed`]. Such items are not retried automatically.
    pub async fn scheduled_transfer(&self, item_id: i64, now: DateTime<Utc>) -> Result<TransferOutcome, OrderFlowError> {
        let details = self.fetch_item(item_id).await?;
        let status = details.item.escrow_status;
        if status != EscrowStatus::Released {
            trace!("🔒️ Order item #{item_id} is {status}. No payout to make.");
            return Ok(TransferOutcome::NotEligible(status));
        }
        let delivered_at = details.transaction.delivered_at.ok_or_else(|| {
            OrderFlowError::rule(format!("Order item #{item_id} is released but has no delivery date"))
        })?;
        let due_at = delivered_at + self.holding_period;
        if now < due_at {
            trace!("🔒️ Payout for order item #{item_id} is due at {due_at}");
            return Ok(TransferOutcome::NotDue { due_at });
        }
        match self.attempt_payout(&details).await {
            Ok(transfer_id) => self.complete_transfer(item_id, &transfer_id, now).await.map(TransferOutcome::Transferred),
            Err(e) => {
                let entry = self.fail_transfer(item_id, EscrowStatus::Released, &e.to_string(), now).await?;
                Ok(TransferOutcome::Failed(entry))
            },
        }
    }

    /// Operator retry of a failed payout. On failure the item stays `TransferFailed`, another failure is recorded in
    /// the ledger and the provider's error is returned.
    pub async fn retry_transfer(&self, item_id: i64) -> Result<EscrowRelease, OrderFlowError> {
        let details = self.fetch_item(item_id).await?;
        if details.item.escrow_status != EscrowStatus::TransferFailed {
            return Err(OrderFlowError::rule(format!(
                "Only failed payouts can be retried. Escrow for order item #{item_id} is {}",
                details.item.escrow_status
            )));
        }
        let now = Utc::now();
        match self.attempt_payout(&details).await {
            Ok(transfer_id) => self.complete_transfer(item_id, &transfer_id, now).await,
            Err(e) => {
                self.fail_transfer(item_id, EscrowStatus::TransferFailed, &e.to_string(), now).await?;
                Err(e)
            },
        }
    }

    /// The provider reported that a payout was created. Returns `None` if it was already recorded.
    pub async fn confirm_transfer(
        &self,
        item_id: i64,
        transfer_id: &str,
    ) -> Result<Option<EscrowRelease>, OrderFlowError> {
        let details = self.fetch_item(item_id).await?;
        match details.item.escrow_status {
            EscrowStatus::Released | EscrowStatus::TransferFailed => {
                if self.db.ledger_has_reference(item_id, transfer_id).await? {
                    return Ok(None);
                }
                self.complete_transfer(item_id, transfer_id, Utc::now()).await.map(Some)
            },
            status => {
                debug!("🔒️ Transfer {transfer_id} reported for order item #{item_id}, which is {status}. Ignoring.");
                Ok(None)
            },
        }
    }

    /// The provider reported that a payout failed after it was accepted. Only items still awaiting payout are
    /// affected.
    pub async fn report_transfer_failure(
        &self,
        item_id: i64,
        reason: &str,
    ) -> Result<Option<EscrowRelease>, OrderFlowError> {
        let details = self.fetch_item(item_id).await?;
        if details.item.escrow_status != EscrowStatus::Released {
            debug!(
                "🔒️ Payout failure reported for order item #{item_id}, which is {}. Ignoring.",
                details.item.escrow_status
            );
            return Ok(None);
        }
        self.fail_transfer(item_id, EscrowStatus::Released, reason, Utc::now()).await.map(Some)
    }

    pub async fn ledger_for(&self, item_id: i64) -> Result<Vec<EscrowRelease>, OrderFlowError> {
        self.fetch_item(item_id).await?;
        Ok(self.db.fetch_ledger(item_id).await?)
    }

    async fn attempt_payout(&self, details: &ItemDetails) -> Result<String, OrderFlowError> {
        let item = &details.item;
        let order = self
            .db
            .fetch_order(item.order_id)
            .await?
            .ok_or_else(|| OrderFlowError::not_found(format!("Order #{}", item.order_id)))?;
        let destination = self
            .db
            .fetch_seller_profile(item.seller_id)
            .await?
            .filter(|p| p.can_receive_payouts())
            .and_then(|p| p.payout_destination)
            .ok_or_else(|| OrderFlowError::rule(format!("Seller #{} has no payout destination", item.seller_id)))?;
        let gateway = self.gateways.gateway_for(order.payment_method)?;
        let metadata = TransferMetadata { order_item_id: item.id, order_ref: order.order_ref.clone() };
        let amount = item.seller_payout();
        debug!("🔒️💳️ Paying out {amount} for order item #{} to seller #{}", item.id, item.seller_id);
        Ok(gateway.transfer_to_seller(&destination, amount, &metadata).await?)
    }

    async fn complete_transfer(
        &self,
        item_id: i64,
        transfer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EscrowRelease, OrderFlowError> {
        let entry = self.db.record_transfer(item_id, transfer_id, now).await.map_err(|e| {
            error!(
                "🔒️ Payout {transfer_id} for order item #{item_id} was sent but could not be recorded. Manual \
                 reconciliation is required. {e}"
            );
            OrderFlowError::from(e)
        })?;
        info!("🔒️ Paid out {} for order item #{item_id} ({transfer_id})", entry.amount);
        self.producers.publish_escrow_moved(EscrowMovedEvent::new(entry.clone())).await;
        Ok(entry)
    }

    async fn fail_transfer(
        &self,
        item_id: i64,
        expected: EscrowStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<EscrowRelease, OrderFlowError> {
        warn!("🔒️ Payout for order item #{item_id} failed. {reason}");
        let entry = self.db.record_transfer_failure(item_id, expected, reason, now).await?;
        self.producers.publish_escrow_moved(EscrowMovedEvent::new(entry.clone())).await;
        Ok(entry)
    }

    async fn fetch_item(&self, item_id: i64) -> Result<ItemDetails, OrderFlowError> {
        self.db.fetch_item_details(item_id).await?.ok_or_else(|| OrderFlowError::not_found(format!("Order item #{item_id}")))
    }
}
