use actix_web::{http::StatusCode, test::TestRequest};
use escrow_engine::{
    db_types::{OrderStatusType, PaymentMethod},
    gateway::CanonicalEvent,
    test_utils::{mock_gateway::MockGateway, seed::TestMarketplace},
    MarketplaceDatabase,
};
use serde_json::Value;

use super::helpers::*;
use crate::routes::{signature_header, CARD_SIGNATURE_HEADER};

fn webhook(provider: &str, payload: &[u8], signature: Option<&str>) -> TestRequest {
    let mut req = TestRequest::post()
        .uri(&format!("/webhook/{provider}"))
        .insert_header(("Content-Type", "application/json"))
        .set_payload(payload.to_vec());
    if let Some(signature) = signature {
        req = req.insert_header((CARD_SIGNATURE_HEADER, signature));
    }
    req
}

fn result_of(body: &str) -> String {
    let json = serde_json::from_str::<Value>(body).unwrap();
    json["result"].as_str().unwrap_or_default().to_string()
}

#[actix_web::test]
async fn payment_webhook_confirms_the_order_once() {
    let market = TestMarketplace::new().await;
    let order = placed_order(&market).await;
    let event = CanonicalEvent::PaymentSucceeded { event_id: "evt_1".into(), charge_id: charge_id(&order) };
    let (payload, signature) = MockGateway::sign_event(&event);

    // Not settled yet, so the provider is asked to redeliver
    let (status, _) = send(&market, webhook("card", &payload, Some(&signature))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    market.gateway.mark_paid(&charge_id(&order));
    let (status, body) = send(&market, webhook("card", &payload, Some(&signature))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result_of(&body), "applied");
    let details = market.db.fetch_order_details(order.order().id).await.unwrap().unwrap();
    assert_eq!(details.order.status, OrderStatusType::Processing);

    let (status, body) = send(&market, webhook("card", &payload, Some(&signature))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result_of(&body), "duplicate");
    market.tear_down().await;
}

#[actix_web::test]
async fn rejected_webhooks() {
    let market = TestMarketplace::new().await;
    let order = placed_order(&market).await;
    market.gateway.mark_paid(&charge_id(&order));
    let event = CanonicalEvent::PaymentSucceeded { event_id: "evt_2".into(), charge_id: charge_id(&order) };
    let (payload, signature) = MockGateway::sign_event(&event);

    let (status, _) = send(&market, webhook("paypal", &payload, Some(&signature))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&market, webhook("card", &payload, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let forged = MockGateway::sign_payload(b"{}");
    let (status, _) = send(&market, webhook("card", &payload, Some(&forged))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let details = market.db.fetch_order_details(order.order().id).await.unwrap().unwrap();
    assert_eq!(details.order.status, OrderStatusType::Pending);
    assert!(!market.db.is_webhook_processed(PaymentMethod::Card, "evt_2").await.unwrap());
    market.tear_down().await;
}

#[actix_web::test]
async fn unsupported_events_are_acknowledged() {
    let market = TestMarketplace::new().await;
    let payload = br#"{"CustomerUpdated":{"event_id":"evt_3"}}"#;
    let signature = MockGateway::sign_payload(payload);
    let (status, body) = send(&market, webhook("card", payload, Some(&signature))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result_of(&body), "ignored");
    market.tear_down().await;
}

#[test]
fn each_provider_has_its_own_signature_header() {
    assert_eq!(signature_header(PaymentMethod::Card), "X-Card-Signature");
    assert_eq!(signature_header(PaymentMethod::QrTransfer), "X-QR-Checksum");
}
