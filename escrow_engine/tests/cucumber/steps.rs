use chrono::{Duration, Utc};
use cucumber::{then, when};
use escrow_engine::{
    api::order_objects::{Actor, ItemStatusUpdate, NewOrderRequest, PaymentProof},
    db_types::{EscrowStatus, ItemStatus, OrderStatusType, PaymentMethod},
    traits::CatalogManagement,
    OrderFlowError,
    ReconciliationConfig,
};
use market_common::{FeeRate, Money};

use crate::cucumber::MarketplaceWorld;

fn money(s: &str) -> Money {
    s.parse().expect("Not a valid amount")
}

fn payment_method(s: &str) -> PaymentMethod {
    PaymentMethod::from_slug(s).unwrap_or_else(|| panic!("Unknown payment method {s}"))
}

async fn place_order(world: &mut MarketplaceWorld, buyer: i64, titles: &[String], method: &str) {
    let address = world.market().address(buyer).await;
    let product_ids = titles.iter().map(|t| world.product(t).id).collect();
    let request =
        NewOrderRequest { shipping_address_id: address.id, payment_method: payment_method(method), product_ids };
    let result = world.market().orders.create_order(buyer, request).await;
    if let Some(order) = world.record(result) {
        world.order = Some(order);
    }
}

#[when(expr = "buyer {int} orders {string} by {word}")]
async fn order_one(world: &mut MarketplaceWorld, buyer: i64, title: String, method: String) {
    place_order(world, buyer, &[title], &method).await;
}

#[when(expr = "buyer {int} orders {string} and {string} by {word}")]
async fn order_two(world: &mut MarketplaceWorld, buyer: i64, first: String, second: String, method: String) {
    place_order(world, buyer, &[first, second], &method).await;
}

#[when("the provider settles the charge")]
async fn settle_charge(world: &mut MarketplaceWorld) {
    let charge_id = world.charge_id();
    world.market().gateway.mark_paid(&charge_id);
}

#[when(expr = "buyer {int} confirms payment")]
async fn confirm_payment(world: &mut MarketplaceWorld, buyer: i64) {
    let proof = PaymentProof { charge_id: world.charge_id() };
    let result = world.market().orders.confirm_payment(world.order_id(), Actor::User(buyer), proof).await;
    world.record(result);
}

#[when(expr = "seller {int} ships {string} with tracking number {string}")]
async fn ship(world: &mut MarketplaceWorld, seller: i64, title: String, tracking: String) {
    let item = world.item(&title).await;
    let update = ItemStatusUpdate::new(ItemStatus::Shipped).with_tracking_number(tracking);
    let result = world.market().orders.update_item_status(item.id, Actor::User(seller), update).await;
    world.record(result);
}

#[when(expr = "buyer {int} confirms delivery of {string}")]
async fn deliver(world: &mut MarketplaceWorld, buyer: i64, title: String) {
    let item = world.item(&title).await;
    let update = ItemStatusUpdate::new(ItemStatus::Delivered);
    let result = world.market().orders.update_item_status(item.id, Actor::User(buyer), update).await;
    world.record(result);
}

#[when(expr = "user {int} cancels {string}")]
async fn cancel_item(world: &mut MarketplaceWorld, user: i64, title: String) {
    let item = world.item(&title).await;
    let update = ItemStatusUpdate::new(ItemStatus::Cancelled);
    let result = world.market().orders.update_item_status(item.id, Actor::User(user), update).await;
    world.record(result);
}

#[when(expr = "user {int} cancels the order")]
async fn cancel_order(world: &mut MarketplaceWorld, user: i64) {
    let result = world.market().orders.cancel_order(world.order_id(), Actor::User(user)).await;
    world.record(result);
}

#[when(expr = "the reconciliation scheduler runs {int} hours later")]
async fn reconcile_hours(world: &mut MarketplaceWorld, hours: i64) {
    let scheduler = world.market().reconciliation(ReconciliationConfig::default());
    scheduler.tick(Utc::now() + Duration::hours(hours)).await;
}

#[when(expr = "the reconciliation scheduler runs {int} days later")]
async fn reconcile_days(world: &mut MarketplaceWorld, days: i64) {
    let scheduler = world.market().reconciliation(ReconciliationConfig::default());
    // A minute of slack so that "7 days later" is past a delivery made a moment ago
    scheduler.tick(Utc::now() + Duration::days(days) + Duration::minutes(1)).await;
}

#[when(expr = "an operator retries the payout for {string}")]
async fn retry(world: &mut MarketplaceWorld, title: String) {
    let item = world.item(&title).await;
    let result = world.market().escrow.retry_transfer(item.id).await;
    world.record(result);
}

#[then(expr = "the order total is {word}")]
async fn order_total(world: &mut MarketplaceWorld, total: String) {
    let details = world.details().await;
    assert_eq!(details.order.total_amount, money(&total));
    let sum = details.items.iter().map(|i| i.item.price).sum::<Money>();
    assert_eq!(details.order.total_amount, sum, "Order total must equal the sum of its items");
}

#[then(expr = "the platform fee for {string} is {word}")]
async fn platform_fee(world: &mut MarketplaceWorld, title: String, fee: String) {
    assert_eq!(world.item(&title).await.platform_fee, money(&fee));
}

#[then(expr = "the fee rate for {string} is {int} bps")]
async fn fee_rate(world: &mut MarketplaceWorld, title: String, bps: i64) {
    assert_eq!(world.item(&title).await.fee_rate, FeeRate::from_bps(bps));
}

#[then(expr = "the order status is {word}")]
async fn order_status(world: &mut MarketplaceWorld, status: String) {
    let expected = status.parse::<OrderStatusType>().expect("Not a valid order status");
    assert_eq!(world.details().await.order.status, expected);
}

#[then(expr = "{string} is {word}")]
async fn item_status(world: &mut MarketplaceWorld, title: String, status: String) {
    let expected = status.parse::<ItemStatus>().expect("Not a valid item status");
    assert_eq!(world.item(&title).await.status, expected);
}

#[then(expr = "escrow for {string} is {word}")]
async fn escrow_status(world: &mut MarketplaceWorld, title: String, status: String) {
    let expected = status.parse::<EscrowStatus>().expect("Not a valid escrow status");
    assert_eq!(world.item(&title).await.escrow_status, expected);
}

#[then(expr = "{string} is on sale again")]
async fn product_active(world: &mut MarketplaceWorld, title: String) {
    let id = world.product(&title).id;
    let product = world.market().db.fetch_product(id).await.unwrap().unwrap();
    assert_eq!(product.status, escrow_engine::db_types::ProductStatus::Active);
}

#[then(expr = "the ledger for {string} has {int} entries")]
async fn ledger_entries(world: &mut MarketplaceWorld, title: String, count: usize) {
    let item = world.item(&title).await;
    let ledger = world.market().escrow.ledger_for(item.id).await.unwrap();
    assert_eq!(ledger.len(), count, "Ledger: {ledger:?}");
}

#[then(expr = "seller {int} has received {int} payout(s) totalling {word}")]
async fn payouts(world: &mut MarketplaceWorld, seller: i64, count: usize, total: String) {
    let destination = format!("acct_{seller}");
    let transfers =
        world.market().gateway.transfers().into_iter().filter(|t| t.destination == destination).collect::<Vec<_>>();
    assert_eq!(transfers.len(), count);
    assert_eq!(transfers.iter().map(|t| t.amount).sum::<Money>(), money(&total));
}

#[then(expr = "the buyer has been refunded {word} in {int} refund(s)")]
async fn refunds(world: &mut MarketplaceWorld, total: String, count: usize) {
    let refunds = world.market().gateway.refunds();
    assert_eq!(refunds.len(), count);
    assert_eq!(refunds.iter().map(|r| r.amount).sum::<Money>(), money(&total));
}

#[then(expr = "the request fails with a {word} error")]
async fn request_failed(world: &mut MarketplaceWorld, kind: String) {
    let err = world.last_error.as_ref().expect("The last request succeeded");
    let matched = match kind.as_str() {
        "validation" => matches!(err, OrderFlowError::Validation(_)),
        "rule" => matches!(err, OrderFlowError::BusinessRule(_)),
        "gateway" => matches!(err, OrderFlowError::Gateway(_)),
        "missing" => matches!(err, OrderFlowError::NotFound(_)),
        other => panic!("Unknown error kind {other}"),
    };
    assert!(matched, "Expected a {kind} error, got {err}");
}

#[then("the request succeeds")]
async fn request_succeeded(world: &mut MarketplaceWorld) {
    assert!(world.last_error.is_none(), "Request failed: {:?}", world.last_error);
}

#[then("no order was placed")]
async fn no_order(world: &mut MarketplaceWorld) {
    assert!(world.order.is_none());
    assert_eq!(world.market().gateway.charge_count(), 0);
}
