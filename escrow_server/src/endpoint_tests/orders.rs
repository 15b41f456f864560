use actix_web::{http::StatusCode, test::TestRequest};
use escrow_engine::{
    api::order_objects::CreatedOrder,
    db_types::{EscrowStatus, ItemStatus, Order, OrderStatusType},
    test_utils::seed::TestMarketplace,
    traits::{ItemTransition, OrderDetails},
};
use market_common::Money;
use serde_json::json;

use super::helpers::*;

#[actix_web::test]
async fn health_check() {
    let market = TestMarketplace::new().await;
    let (status, body) = send(&market, TestRequest::get().uri("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "👍️\n");
    market.tear_down().await;
}

#[actix_web::test]
async fn placing_an_order_needs_a_user() {
    let market = TestMarketplace::new().await;
    let request = order_request(&market).await;

    let (status, body) = send(&market, TestRequest::post().uri("/api/orders").set_json(&request)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("X-Actor-Id"), "{body}");

    let req = as_admin(TestRequest::post().uri("/api/orders").set_json(&request));
    let (status, _) = send(&market, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(market.gateway.charge_count(), 0);
    market.tear_down().await;
}

#[actix_web::test]
async fn place_and_fetch_an_order() {
    let market = TestMarketplace::new().await;
    let request = order_request(&market).await;
    let req = as_user(TestRequest::post().uri("/api/orders").set_json(&request), BUYER);
    let (status, body) = send(&market, req).await;
    assert_eq!(status, StatusCode::CREATED);
    let created = serde_json::from_str::<CreatedOrder>(&body).unwrap();
    assert_eq!(created.order().total_amount, Money::from_cents(15_000));
    assert_eq!(created.order().status, OrderStatusType::Pending);
    assert_eq!(created.details.items.len(), 2);
    assert!(!created.redirect.is_empty());

    let path = format!("/api/orders/{}", created.order().id);
    let (status, body) = send(&market, as_user(TestRequest::get().uri(&path), BUYER)).await;
    assert_eq!(status, StatusCode::OK);
    let details = serde_json::from_str::<OrderDetails>(&body).unwrap();
    assert_eq!(details, created.details);

    let (status, _) = send(&market, as_user(TestRequest::get().uri(&path), SELLER_B)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&market, as_admin(TestRequest::get().uri(&path))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&market, as_user(TestRequest::get().uri(&path), 999)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    market.tear_down().await;
}

#[actix_web::test]
async fn invalid_orders() {
    let market = TestMarketplace::new().await;
    let mut request = order_request(&market).await;

    let req = as_user(TestRequest::post().uri("/api/orders").set_json(json!({"product_ids": "all"})), BUYER);
    let (status, _) = send(&market, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    request.product_ids.clear();
    let req = as_user(TestRequest::post().uri("/api/orders").set_json(&request), BUYER);
    let (status, body) = send(&market, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("error"), "{body}");

    // Buying your own listing
    let own = market.product(SELLER_A, "Tripod", 2_500).await;
    request.product_ids = vec![own.id];
    let address = market.address(SELLER_A).await;
    request.shipping_address_id = address.id;
    let req = as_user(TestRequest::post().uri("/api/orders").set_json(&request), SELLER_A);
    let (status, _) = send(&market, req).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    market.gateway.fail_charges(true);
    let other = market.product(SELLER_B, "Lens cap", 800).await;
    request.product_ids = vec![other.id];
    let req = as_user(TestRequest::post().uri("/api/orders").set_json(&request), SELLER_A);
    let (status, _) = send(&market, req).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    market.tear_down().await;
}

#[actix_web::test]
async fn payment_shipping_and_delivery() {
    let market = TestMarketplace::new().await;
    let order = placed_order(&market).await;
    let [item1, _] = item_ids(&order);
    let order_id = order.order().id;
    let confirm = || {
        TestRequest::post()
            .uri(&format!("/api/orders/{order_id}/confirm_payment"))
            .set_json(json!({ "charge_id": charge_id(&order) }))
    };

    let (status, _) = send(&market, as_user(confirm(), BUYER)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "Unpaid charges must not confirm the order");

    market.gateway.mark_paid(&charge_id(&order));
    let (status, _) = send(&market, as_user(confirm(), SELLER_A)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "Only the buyer confirms payment");
    let (status, body) = send(&market, as_user(confirm(), BUYER)).await;
    assert_eq!(status, StatusCode::OK);
    let paid = serde_json::from_str::<Order>(&body).unwrap();
    assert_eq!(paid.status, OrderStatusType::Processing);
    assert!(paid.paid_at.is_some());

    let status_path = format!("/api/items/{item1}/status");
    let ship = |tracking: Option<&str>| {
        TestRequest::post().uri(&status_path).set_json(json!({ "status": "Shipped", "tracking_number": tracking }))
    };
    let (status, _) = send(&market, as_user(ship(None), SELLER_A)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&market, as_user(ship(Some("X123")), BUYER)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let (status, body) = send(&market, as_user(ship(Some("X123")), SELLER_A)).await;
    assert_eq!(status, StatusCode::OK);
    let shipped = serde_json::from_str::<ItemTransition>(&body).unwrap();
    assert_eq!(shipped.item.status, ItemStatus::Shipped);
    assert_eq!(shipped.order.status, OrderStatusType::Shipped);

    let deliver = TestRequest::post().uri(&status_path).set_json(json!({ "status": "Delivered" }));
    let (status, body) = send(&market, as_user(deliver, BUYER)).await;
    assert_eq!(status, StatusCode::OK);
    let delivered = serde_json::from_str::<ItemTransition>(&body).unwrap();
    assert_eq!(delivered.item.escrow_status, EscrowStatus::Released);
    assert_eq!(delivered.ledger_entry.map(|e| e.amount), Some(Money::from_cents(9_500)));
    market.tear_down().await;
}

#[actix_web::test]
async fn cancel_an_unpaid_order() {
    let market = TestMarketplace::new().await;
    let order = placed_order(&market).await;
    let path = format!("/api/orders/{}/cancel", order.order().id);

    let (status, _) = send(&market, as_user(TestRequest::post().uri(&path), 999)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    market.gateway.fail_refunds(true);
    let (status, _) = send(&market, as_user(TestRequest::post().uri(&path), BUYER)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    market.gateway.fail_refunds(false);
    let (status, body) = send(&market, as_user(TestRequest::post().uri(&path), BUYER)).await;
    assert_eq!(status, StatusCode::OK);
    let details = serde_json::from_str::<OrderDetails>(&body).unwrap();
    assert_eq!(details.order.status, OrderStatusType::Cancelled);
    assert!(details.items.iter().all(|i| i.item.escrow_status == EscrowStatus::Refunded));
    assert_eq!(market.gateway.refunds().len(), 1);

    let (status, _) = send(&market, as_user(TestRequest::post().uri(&path), BUYER)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    market.tear_down().await;
}
