use actix_web::{http::StatusCode, test::TestRequest};
use chrono::{Duration, Utc};
use escrow_engine::{
    api::order_objects::{Actor, ItemStatusUpdate, PaymentProof},
    db_types::{EscrowMovement, EscrowRelease, ItemStatus},
    test_utils::seed::TestMarketplace,
    TransferOutcome,
};
use market_common::Money;

use super::helpers::*;
use crate::auth::ADMIN_KEY_HEADER;

/// Pays for the two item order and delivers the first item. Returns the delivered item's id.
async fn delivered_item(market: &TestMarketplace) -> i64 {
    let order = placed_order(market).await;
    let [item1, _] = item_ids(&order);
    market.gateway.mark_paid(&charge_id(&order));
    let proof = PaymentProof { charge_id: charge_id(&order) };
    market.orders.confirm_payment(order.order().id, Actor::User(BUYER), proof).await.unwrap();
    let ship = ItemStatusUpdate::new(ItemStatus::Shipped).with_tracking_number("X123");
    market.orders.update_item_status(item1, Actor::User(SELLER_A), ship).await.unwrap();
    let deliver = ItemStatusUpdate::new(ItemStatus::Delivered);
    market.orders.update_item_status(item1, Actor::User(BUYER), deliver).await.unwrap();
    item1
}

#[actix_web::test]
async fn ledger_is_for_operators_only() {
    let market = TestMarketplace::new().await;
    let item = delivered_item(&market).await;
    let path = format!("/api/items/{item}/ledger");

    let (status, _) = send(&market, as_user(TestRequest::get().uri(&path), SELLER_A)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let forged = TestRequest::get().uri(&path).insert_header((ADMIN_KEY_HEADER, "guess"));
    let (status, _) = send(&market, forged).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&market, as_admin(TestRequest::get().uri(&path))).await;
    assert_eq!(status, StatusCode::OK);
    let ledger = serde_json::from_str::<Vec<EscrowRelease>>(&body).unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].movement, EscrowMovement::Release);
    assert_eq!(ledger[0].amount, Money::from_cents(9_500));

    let (status, _) = send(&market, as_admin(TestRequest::get().uri("/api/items/9999/ledger"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    market.tear_down().await;
}

#[actix_web::test]
async fn operators_retry_failed_payouts() {
    let market = TestMarketplace::new().await;
    let item = delivered_item(&market).await;
    let path = format!("/api/items/{item}/retry_transfer");

    let (status, _) = send(&market, as_admin(TestRequest::post().uri(&path))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "Only failed payouts can be retried");

    market.gateway.fail_transfers(true);
    let outcome = market.escrow.scheduled_transfer(item, Utc::now() + Duration::days(8)).await.unwrap();
    assert!(matches!(outcome, TransferOutcome::Failed(_)), "{outcome:?}");
    let (status, _) = send(&market, as_admin(TestRequest::post().uri(&path))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    market.gateway.fail_transfers(false);
    let (status, _) = send(&market, as_user(TestRequest::post().uri(&path), SELLER_A)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, body) = send(&market, as_admin(TestRequest::post().uri(&path))).await;
    assert_eq!(status, StatusCode::OK);
    let entry = serde_json::from_str::<EscrowRelease>(&body).unwrap();
    assert_eq!(entry.movement, EscrowMovement::Transfer);
    assert_eq!(entry.amount, Money::from_cents(9_500));
    assert_eq!(market.gateway.transfers().len(), 1);
    market.tear_down().await;
}
