use actix_web::{http::StatusCode, test, test::TestRequest, web, App};
use escrow_engine::{
    api::order_objects::{CreatedOrder, NewOrderRequest},
    db_types::PaymentMethod,
    test_utils::{mock_gateway::MockGateway, seed::TestMarketplace},
    SqliteDatabase,
};
use log::debug;

use crate::{
    auth::{AccessConfig, ACTOR_ID_HEADER, ADMIN_KEY_HEADER},
    server::configure_routes,
};

pub const ADMIN_KEY: &str = "test-admin-key";
pub const BUYER: i64 = 1;
pub const SELLER_A: i64 = 10;
pub const SELLER_B: i64 = 11;

/// Runs `req` against the full route table, backed by `market`. Returns the status and the body as text.
pub async fn send(market: &TestMarketplace, req: TestRequest) -> (StatusCode, String) {
    let app = App::new()
        .app_data(web::Data::new(market.orders.clone()))
        .app_data(web::Data::new(market.escrow.clone()))
        .app_data(web::Data::new(market.webhooks()))
        .app_data(web::Data::new(AccessConfig::new(ADMIN_KEY)))
        .configure(configure_routes::<SqliteDatabase, MockGateway>);
    let service = test::init_service(app).await;
    debug!("Making request");
    let res = test::call_service(&service, req.to_request()).await;
    let status = res.status();
    let body = test::read_body(res).await;
    (status, String::from_utf8_lossy(&body).into_owned())
}

pub fn as_user(req: TestRequest, user_id: i64) -> TestRequest {
    req.insert_header((ACTOR_ID_HEADER, user_id.to_string()))
}

pub fn as_admin(req: TestRequest) -> TestRequest {
    req.insert_header((ADMIN_KEY_HEADER, ADMIN_KEY))
}

/// Sellers A and B, a product from each (100.00 and 50.00) and an address for the buyer.
pub async fn order_request(market: &TestMarketplace) -> NewOrderRequest {
    market.seller(SELLER_A, false, false).await;
    market.seller(SELLER_B, false, false).await;
    let p1 = market.product(SELLER_A, "Vintage camera", 10_000).await;
    let p2 = market.product(SELLER_B, "Leather strap", 5_000).await;
    let address = market.address(BUYER).await;
    NewOrderRequest { shipping_address_id: address.id, payment_method: PaymentMethod::Card, product_ids: vec![p1.id, p2.id] }
}

/// Places the two item order directly through the engine.
pub async fn placed_order(market: &TestMarketplace) -> CreatedOrder {
    let request = order_request(market).await;
    market.orders.create_order(BUYER, request).await.expect("Error creating order")
}

pub fn item_ids(order: &CreatedOrder) -> [i64; 2] {
    let items = &order.details.items;
    [items[0].item.id, items[1].item.id]
}

pub fn charge_id(order: &CreatedOrder) -> String {
    order.details.charge_id().expect("Order has no charge").to_string()
}
