use escrow_engine::{
    db_types::EscrowMovement,
    events::{EscrowMovedEvent, EventHandlers, EventHooks, OrderAnnulledEvent, OrderPaidEvent},
};
use log::*;

pub const NOTIFICATION_EVENT_BUFFER_SIZE: usize = 25;

/// Creates the event handlers that tell buyers and sellers what happened to their orders.
///
/// Delivery (mail, push, chat) belongs to the notification service, which consumes the server log. The hooks
/// here only record the facts it needs:
///
/// 1. OrderPaidEvent - the buyer's payment was confirmed and sellers can start processing.
/// 2. OrderAnnulledEvent - items were cancelled and refunded.
/// 3. EscrowMovedEvent - money moved in escrow: released at delivery, paid out, refunded, or a payout failed.
pub fn create_notification_event_handlers() -> EventHandlers {
    let mut hooks = EventHooks::default();
    hooks.on_order_paid(|ev| {
        let OrderPaidEvent { order } = ev;
        info!(
            "📬️ Order {} (#{}) for buyer #{} has been paid: {}",
            order.order_ref, order.id, order.buyer_id, order.total_amount
        );
        Box::pin(async {})
    });
    hooks.on_order_annulled(|ev| {
        let OrderAnnulledEvent { order, cancelled_items } = ev;
        info!(
            "📬️ {} item(s) of order {} were cancelled. Items: {cancelled_items:?}. The order is now {}",
            cancelled_items.len(),
            order.order_ref,
            order.status
        );
        Box::pin(async {})
    });
    hooks.on_escrow_moved(|ev| {
        let EscrowMovedEvent { entry } = ev;
        let item = entry.order_item_id;
        match entry.movement {
            EscrowMovement::Release => {
                info!("📬️ {} for item #{item} was released to the seller and will be paid out", entry.amount)
            },
            EscrowMovement::Transfer => info!("📬️ {} for item #{item} has been paid out to the seller", entry.amount),
            EscrowMovement::Refund => info!("📬️ {} for item #{item} has been refunded to the buyer", entry.amount),
            EscrowMovement::TransferFailure => {
                warn!("📬️ Payout of {} for item #{item} failed and needs an operator. {}", entry.amount, entry.reason)
            },
        }
        Box::pin(async {})
    });
    EventHandlers::new(NOTIFICATION_EVENT_BUFFER_SIZE, hooks)
}
