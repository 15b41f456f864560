use std::{collections::HashSet, fmt::Debug};

use chrono::Utc;
use log::*;
use market_common::Money;
use uuid::Uuid;

use crate::{
    api::{
        errors::OrderFlowError,
        order_objects::{Actor, CreatedOrder, ItemStatusUpdate, NewOrderRequest, PaymentProof},
    },
    db_types::{EscrowRelease, ItemStatus, NewLineItem, Order, OrderDraft, OrderStatusType, ProductStatus},
    events::{EscrowMovedEvent, EventProducers, OrderAnnulledEvent, OrderPaidEvent},
    fees::{FeeDefaults, FeeSchedule},
    gateway::{GatewayError, GatewayRegistry, PaymentGateway},
    traits::{CancelledItem, ItemDetails, ItemTransition, MarketplaceDatabase, MarketplaceDbError, OrderDetails},
};

/// `OrderFlowApi` is the order orchestrator. It validates and creates orders, applies status changes requested by
/// buyers, sellers and operators, and keeps the escrow ledger and the payment provider in step with them.
///
/// Provider calls are never made while a database transaction is open. Before a refund is requested, the items it
/// covers are claimed, so two cancellations racing for the same item cannot both reach the provider. If the provider
/// rejects the refund, the claim is dropped and nothing changes locally. A timed-out refund keeps its claim until the
/// same cancellation is retried.
#[derive(Clone)]
pub struct OrderFlowApi<B, G> {
    db: B,
    gateways: G,
    fees: FeeDefaults,
    producers: EventProducers,
}

impl<B, G> Debug for OrderFlowApi<B, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OrderFlowApi")
    }
}

impl<B, G> OrderFlowApi<B, G> {
    pub fn new(db: B, gateways: G, producers: EventProducers) -> Self {
        Self { db, gateways, fees: FeeDefaults::default(), producers }
    }

    pub fn with_fee_defaults(mut self, fees: FeeDefaults) -> Self {
        self.fees = fees;
        self
    }

    pub fn db(&self) -> &B {
        &self.db
    }

    pub fn gateways(&self) -> &G {
        &self.gateways
    }
}

impl<B, G> OrderFlowApi<B, G>
where
    B: MarketplaceDatabase,
    G: GatewayRegistry,
{
    /// Creates a new order for `buyer_id`.
    ///
    /// Every product must be on sale, belong to someone other than the buyer, and be sold by a seller who can receive
    /// payouts. The price is the buyer's accepted offer if there is one, otherwise the list price. The charge is
    /// opened with the provider first; only then are the order, its items and their transactions written, all at once.
    pub async fn create_order(&self, buyer_id: i64, request: NewOrderRequest) -> Result<CreatedOrder, OrderFlowError> {
        let NewOrderRequest { shipping_address_id, payment_method, product_ids } = request;
        if product_ids.is_empty() {
            return Err(OrderFlowError::validation("An order needs at least one item"));
        }
        let mut seen = HashSet::with_capacity(product_ids.len());
        if let Some(dup) = product_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(OrderFlowError::validation(format!("Product #{dup} appears more than once")));
        }
        let address = self
            .db
            .fetch_address(shipping_address_id)
            .await?
            .ok_or_else(|| OrderFlowError::not_found(format!("Address #{shipping_address_id}")))?;
        if address.user_id != buyer_id {
            return Err(OrderFlowError::rule(format!(
                "Address #{shipping_address_id} does not belong to user #{buyer_id}"
            )));
        }
        let gateway = self.gateways.gateway_for(payment_method)?;
        let schedule = FeeSchedule::new(self.db.fetch_fee_tiers().await?, self.fees);

        let mut lines = Vec::with_capacity(product_ids.len());
        for product_id in product_ids {
            lines.push(self.price_line(buyer_id, product_id, &schedule).await?);
        }
        let order_ref = Uuid::new_v4().to_string();
        let draft = OrderDraft::new(order_ref, buyer_id, &address, payment_method, lines)
            .ok_or_else(|| OrderFlowError::validation("An order needs at least one item"))?;
        let total = draft.total_amount();
        trace!("🔄️📦️ Opening a {payment_method} charge of {total} for order {}", draft.order_ref());
        let charge = gateway.create_charge(total, draft.order_ref()).await?;
        let details = self.db.insert_order(&draft, &charge.charge_id, Utc::now()).await.map_err(|e| {
            error!(
                "🔄️📦️ Charge {} was opened for order {} but the order could not be saved. The charge will never be \
                 confirmed. {e}",
                charge.charge_id,
                draft.order_ref()
            );
            OrderFlowError::from(e)
        })?;
        info!(
            "🔄️📦️ Order #{} ({}) created for user #{buyer_id}: {} items, total {total}",
            details.order.id,
            details.order.order_ref,
            details.items.len()
        );
        Ok(CreatedOrder { details, redirect: charge.redirect })
    }

    async fn price_line(
        &self,
        buyer_id: i64,
        product_id: i64,
        schedule: &FeeSchedule,
    ) -> Result<NewLineItem, OrderFlowError> {
        let product = self
            .db
            .fetch_product(product_id)
            .await?
            .ok_or_else(|| OrderFlowError::not_found(format!("Product #{product_id}")))?;
        if product.status != ProductStatus::Active {
            return Err(OrderFlowError::rule(format!("Product #{product_id} is {} and cannot be bought", product.status)));
        }
        if product.seller_id == buyer_id {
            return Err(OrderFlowError::rule(format!("User #{buyer_id} cannot buy their own product #{product_id}")));
        }
        let seller = self
            .db
            .fetch_seller_profile(product.seller_id)
            .await?
            .ok_or_else(|| OrderFlowError::not_found(format!("Seller profile #{}", product.seller_id)))?;
        if !seller.can_receive_payouts() {
            return Err(OrderFlowError::rule(format!(
                "Seller #{} cannot receive payouts, so product #{product_id} cannot be bought",
                seller.user_id
            )));
        }
        let price = match self.db.fetch_accepted_offer(product_id, buyer_id).await? {
            Some(offer) => {
                debug!("🔄️📦️ Using accepted offer #{} ({}) for product #{product_id}", offer.id, offer.price);
                offer.price
            },
            None => product.price,
        };
        if !price.is_positive() {
            return Err(OrderFlowError::validation(format!("Product #{product_id} has no valid price")));
        }
        let quote = schedule.compute_fee(price, &seller);
        trace!("🔄️📦️ Product #{product_id}: price {price}, fee {} ({})", quote.fee, quote.fee_rate);
        Ok(NewLineItem {
            product_id,
            seller_id: product.seller_id,
            price,
            platform_fee: quote.fee,
            fee_rate: quote.fee_rate,
        })
    }

    /// Confirms payment for a `Pending` order. The provider is the source of truth: the proof only names the charge,
    /// which must be the one recorded for the order, and is then verified with the provider.
    pub async fn confirm_payment(
        &self,
        order_id: i64,
        actor: Actor,
        proof: PaymentProof,
    ) -> Result<Order, OrderFlowError> {
        let details = self.fetch_details(order_id).await?;
        let order = &details.order;
        if !(actor.is_privileged() || actor.is_user(order.buyer_id)) {
            return Err(OrderFlowError::rule(format!("{actor} cannot confirm payment for order #{order_id}")));
        }
        if order.status != OrderStatusType::Pending {
            return Err(OrderFlowError::rule(format!(
                "Order #{order_id} is {}. Only pending orders can be confirmed",
                order.status
            )));
        }
        let charge_id = details.charge_id().ok_or_else(|| OrderFlowError::not_found(format!("Charge for order #{order_id}")))?;
        if proof.charge_id != charge_id {
            return Err(OrderFlowError::validation(format!(
                "Charge {} does not belong to order #{order_id}",
                proof.charge_id
            )));
        }
        let gateway = self.gateways.gateway_for(order.payment_method)?;
        if !gateway.verify_payment(charge_id).await? {
            return Err(OrderFlowError::rule(format!(
                "The payment provider has not confirmed payment of charge {charge_id}"
            )));
        }
        let paid = self.db.mark_order_paid(order_id, Utc::now()).await?;
        info!("🔄️💰️ Order #{order_id} is paid. {} items are now processing", paid.items.len());
        self.producers.publish_order_paid(OrderPaidEvent::new(paid.order.clone())).await;
        Ok(paid.order)
    }

    /// Applies an actor-requested status change to a single item.
    ///
    /// * sellers ship their `Processing` items, and must give a tracking number;
    /// * buyers confirm delivery of `Shipped` items, which releases the item's escrow;
    /// * buyers and sellers cancel items that have not shipped, which refunds the item through the provider first;
    /// * operators may apply any of these.
    pub async fn update_item_status(
        &self,
        item_id: i64,
        actor: Actor,
        update: ItemStatusUpdate,
    ) -> Result<ItemTransition, OrderFlowError> {
        let details = self
            .db
            .fetch_item_details(item_id)
            .await?
            .ok_or_else(|| OrderFlowError::not_found(format!("Order item #{item_id}")))?;
        let order = self
            .db
            .fetch_order(details.item.order_id)
            .await?
            .ok_or_else(|| OrderFlowError::not_found(format!("Order #{}", details.item.order_id)))?;
        let item = &details.item;
        let is_seller = actor.is_user(item.seller_id);
        let is_buyer = actor.is_user(order.buyer_id);
        let allowed = match update.status {
            ItemStatus::Shipped => is_seller,
            ItemStatus::Delivered => is_buyer,
            ItemStatus::Cancelled => is_buyer || is_seller,
            ItemStatus::Pending | ItemStatus::Processing => {
                return Err(OrderFlowError::rule(format!(
                    "Items cannot be moved to {} directly. They start pending and are processed once payment is \
                     confirmed",
                    update.status
                )));
            },
        };
        if !(allowed || actor.is_privileged()) {
            return Err(OrderFlowError::rule(format!("{actor} cannot mark order item #{item_id} as {}", update.status)));
        }
        if !item.status.can_transition_to(update.status) {
            return Err(OrderFlowError::rule(format!(
                "Order item #{item_id} is {} and cannot become {}",
                item.status, update.status
            )));
        }
        let now = Utc::now();
        match update.status {
            ItemStatus::Shipped => {
                let tracking = update
                    .tracking_number
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| OrderFlowError::validation("A tracking number is required to ship an item"))?;
                let result = self.db.ship_item(item_id, tracking, now).await?;
                info!("🔄️🚚️ Order item #{item_id} shipped with tracking number {tracking}");
                Ok(result)
            },
            ItemStatus::Delivered => {
                let result = self.db.deliver_item(item_id, now).await?;
                info!("🔄️🚚️ Order item #{item_id} delivered. Order #{} is {}", order.id, result.order.status);
                if let Some(entry) = &result.ledger_entry {
                    self.producers.publish_escrow_moved(EscrowMovedEvent::new(entry.clone())).await;
                }
                Ok(result)
            },
            _ => self.cancel_item(&order, &details, actor).await,
        }
    }

    async fn cancel_item(
        &self,
        order: &Order,
        details: &ItemDetails,
        actor: Actor,
    ) -> Result<ItemTransition, OrderFlowError> {
        let item = &details.item;
        let to_cancel = [CancelledItem { item_id: item.id, expected_status: item.status }];
        let (updated, mut entries) =
            self.refund_and_cancel(order, &details.transaction.charge_id, item.price, &to_cancel, actor).await?;
        let item = updated
            .item(item.id)
            .map(|d| d.item.clone())
            .ok_or_else(|| OrderFlowError::not_found(format!("Order item #{}", item.id)))?;
        Ok(ItemTransition { item, order: updated.order, ledger_entry: entries.pop() })
    }

    /// Cancels every item of the order that has not shipped yet, with one refund for their combined price. If any
    /// item has already shipped, the whole request is refused.
    pub async fn cancel_order(&self, order_id: i64, actor: Actor) -> Result<OrderDetails, OrderFlowError> {
        let details = self.fetch_details(order_id).await?;
        let order = &details.order;
        let allowed = actor.is_privileged() ||
            actor.is_user(order.buyer_id) ||
            matches!(actor, Actor::User(id) if details.involves_seller(id));
        if !allowed {
            return Err(OrderFlowError::rule(format!("{actor} cannot cancel order #{order_id}")));
        }
        if order.status == OrderStatusType::Cancelled {
            return Err(OrderFlowError::rule(format!("Order #{order_id} is already cancelled")));
        }
        if let Some(shipped) = details.items.iter().find(|i| i.item.status.has_shipped()) {
            return Err(OrderFlowError::rule(format!(
                "Order #{order_id} cannot be cancelled because item #{} is {}",
                shipped.item.id, shipped.item.status
            )));
        }
        let cancellable = details.items.iter().filter(|i| i.item.status.is_cancellable()).collect::<Vec<_>>();
        if cancellable.is_empty() {
            return Err(OrderFlowError::rule(format!("Order #{order_id} has no items that can be cancelled")));
        }
        let amount = cancellable.iter().map(|i| i.item.price).sum::<Money>();
        let to_cancel = cancellable
            .iter()
            .map(|i| CancelledItem { item_id: i.item.id, expected_status: i.item.status })
            .collect::<Vec<_>>();
        let charge_id = details.charge_id().ok_or_else(|| OrderFlowError::not_found(format!("Charge for order #{order_id}")))?;
        let (updated, _) = self.refund_and_cancel(order, charge_id, amount, &to_cancel, actor).await?;
        Ok(updated)
    }

    /// Claims the items, refunds `amount` through the provider, then records the cancellation. A provider rejection
    /// drops the claim and leaves the order untouched.
    async fn refund_and_cancel(
        &self,
        order: &Order,
        charge_id: &str,
        amount: Money,
        to_cancel: &[CancelledItem],
        actor: Actor,
    ) -> Result<(OrderDetails, Vec<EscrowRelease>), OrderFlowError> {
        let gateway = self.gateways.gateway_for(order.payment_method)?;
        let claim = refund_key(&order.order_ref, to_cancel);
        self.db.claim_items_for_refund(order.id, to_cancel, &claim).await.map_err(|e| {
            info!("🔄️❌️ Items of order #{} could not be claimed for refund. Nothing was refunded. {e}", order.id);
            OrderFlowError::from(e)
        })?;
        let refund_id = match gateway.refund(charge_id, amount, &claim).await {
            Ok(id) => id,
            Err(GatewayError::Timeout) => {
                warn!(
                    "🔄️❌️ Refund {claim} of {amount} for order #{} timed out. The items stay claimed until the \
                     cancellation is retried.",
                    order.id
                );
                return Err(GatewayError::Timeout.into());
            },
            Err(e) => {
                warn!("🔄️❌️ Refund of {amount} for order #{} failed. Nothing was cancelled. {e}", order.id);
                if let Err(release_err) = self.db.release_refund_claim(&claim).await {
                    error!("🔄️❌️ Refund claim {claim} could not be dropped. {release_err}");
                }
                return Err(e.into());
            },
        };
        let reason = format!("Cancelled by {actor}");
        let (updated, entries) =
            self.db.cancel_items(order.id, to_cancel, &claim, &refund_id, &reason, Utc::now()).await.map_err(|e| {
                match &e {
                    // The provider returned the same refund to both requests, and the other one recorded it
                    MarketplaceDbError::ConcurrencyConflict(_) => warn!(
                        "🔄️❌️ Refund {refund_id} for order #{} was already recorded by another request. {e}",
                        order.id
                    ),
                    _ => error!(
                        "🔄️❌️ Refund {refund_id} of {amount} was issued for order #{} but the cancellation could not \
                         be recorded. Manual reconciliation is required. {e}",
                        order.id
                    ),
                }
                OrderFlowError::from(e)
            })?;
        info!(
            "🔄️❌️ {} items of order #{} cancelled by {actor} and {amount} refunded. Order is {}",
            to_cancel.len(),
            order.id,
            updated.order.status
        );
        for entry in &entries {
            self.producers.publish_escrow_moved(EscrowMovedEvent::new(entry.clone())).await;
        }
        let cancelled = to_cancel.iter().map(|c| c.item_id).collect();
        self.producers.publish_order_annulled(OrderAnnulledEvent::new(updated.order.clone(), cancelled)).await;
        Ok((updated, entries))
    }

    /// The order with every item and transaction, for the buyer, any seller in the order, or an operator.
    pub async fn order_details(&self, order_id: i64, actor: Actor) -> Result<OrderDetails, OrderFlowError> {
        let details = self.fetch_details(order_id).await?;
        let allowed = actor.is_privileged() ||
            actor.is_user(details.order.buyer_id) ||
            matches!(actor, Actor::User(id) if details.involves_seller(id));
        if !allowed {
            // Indistinguishable from a missing order, so ids cannot be probed
            return Err(OrderFlowError::not_found(format!("Order #{order_id}")));
        }
        Ok(details)
    }

    async fn fetch_details(&self, order_id: i64) -> Result<OrderDetails, OrderFlowError> {
        self.db.fetch_order_details(order_id).await?.ok_or_else(|| OrderFlowError::not_found(format!("Order #{order_id}")))
    }
}

/// The refund for a set of items of an order. The same items always produce the same key, whichever request cancels
/// them.
fn refund_key(order_ref: &str, items: &[CancelledItem]) -> String {
    let mut ids = items.iter().map(|c| c.item_id).collect::<Vec<_>>();
    ids.sort_unstable();
    let ids = ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
    format!("refund:{order_ref}:{ids}")
}
