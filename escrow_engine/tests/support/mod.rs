#![allow(dead_code)]
use escrow_engine::{
    api::order_objects::{CreatedOrder, NewOrderRequest},
    db_types::{PaymentMethod, Product},
    test_utils::seed::TestMarketplace,
    traits::OrderDetails,
    MarketplaceDatabase,
};
use market_common::Money;

pub const BUYER: i64 = 1;
pub const SELLER_A: i64 = 10;
pub const SELLER_B: i64 = 11;

pub async fn setup() -> TestMarketplace {
    TestMarketplace::new().await
}

pub async fn tear_down(market: TestMarketplace) {
    market.tear_down().await;
}

pub struct TwoItemOrder {
    pub created: CreatedOrder,
    pub products: [Product; 2],
}

impl TwoItemOrder {
    pub fn order_id(&self) -> i64 {
        self.created.order().id
    }

    pub fn item_ids(&self) -> [i64; 2] {
        let items = &self.created.details.items;
        [items[0].item.id, items[1].item.id]
    }

    pub fn charge_id(&self) -> String {
        self.created.details.charge_id().unwrap().to_string()
    }
}

/// Two items from two sellers on the default 5% tier, priced 100.00 and 50.00.
pub async fn two_item_order(market: &TestMarketplace) -> TwoItemOrder {
    market.seller(SELLER_A, false, false).await;
    market.seller(SELLER_B, false, false).await;
    let p1 = market.product(SELLER_A, "Vintage camera", 10_000).await;
    let p2 = market.product(SELLER_B, "Leather strap", 5_000).await;
    let address = market.address(BUYER).await;
    let request = NewOrderRequest {
        shipping_address_id: address.id,
        payment_method: PaymentMethod::Card,
        product_ids: vec![p1.id, p2.id],
    };
    let created = market.orders.create_order(BUYER, request).await.expect("Error creating order");
    TwoItemOrder { created, products: [p1, p2] }
}

pub async fn details(market: &TestMarketplace, order_id: i64) -> OrderDetails {
    market.db.fetch_order_details(order_id).await.unwrap().expect("Order should exist")
}

pub fn assert_total_matches_items(details: &OrderDetails) {
    let sum = details.items.iter().map(|i| i.item.price).sum::<Money>();
    assert_eq!(details.order.total_amount, sum, "Order total does not match its items");
}
