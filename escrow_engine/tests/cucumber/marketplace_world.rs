use std::collections::HashMap;

use cucumber::World;
use escrow_engine::{
    api::order_objects::CreatedOrder,
    db_types::{OrderItem, Product},
    test_utils::seed::TestMarketplace,
    traits::OrderDetails,
    MarketplaceDatabase,
    OrderFlowError,
};
use log::*;

#[derive(Default, Debug, World)]
pub struct MarketplaceWorld {
    pub system: Option<TestMarketplace>,
    pub products: HashMap<String, Product>,
    pub order: Option<CreatedOrder>,
    pub last_error: Option<OrderFlowError>,
}

impl MarketplaceWorld {
    pub async fn start(&mut self) {
        let market = TestMarketplace::new().await;
        debug!("Created database: {}", market.db_path);
        self.system = Some(market);
    }

    pub fn market(&self) -> &TestMarketplace {
        self.system.as_ref().expect("Marketplace not initialised")
    }

    pub fn product(&self, title: &str) -> &Product {
        self.products.get(title).unwrap_or_else(|| panic!("No product called {title}"))
    }

    pub fn order_id(&self) -> i64 {
        self.order.as_ref().expect("No order has been placed").order().id
    }

    pub fn charge_id(&self) -> String {
        let order = self.order.as_ref().expect("No order has been placed");
        order.details.charge_id().expect("Order has no charge").to_string()
    }

    pub async fn details(&self) -> OrderDetails {
        self.market().db.fetch_order_details(self.order_id()).await.unwrap().expect("Order does not exist")
    }

    /// The current state of the order item for the product called `title`.
    pub async fn item(&self, title: &str) -> OrderItem {
        let product_id = self.product(title).id;
        self.details()
            .await
            .items
            .into_iter()
            .map(|i| i.item)
            .find(|i| i.product_id == product_id)
            .unwrap_or_else(|| panic!("{title} is not in the order"))
    }

    pub fn record<T>(&mut self, result: Result<T, OrderFlowError>) -> Option<T> {
        match result {
            Ok(v) => {
                self.last_error = None;
                Some(v)
            },
            Err(e) => {
                info!("Request failed: {e}");
                self.last_error = Some(e);
                None
            },
        }
    }
}
