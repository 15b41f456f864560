use cucumber::given;
use escrow_engine::{db_types::SellerProfile, traits::ProfileManagement};
use market_common::Money;

use crate::cucumber::MarketplaceWorld;

#[given("a fresh install")]
async fn fresh_database(world: &mut MarketplaceWorld) {
    world.start().await;
}

#[given(expr = "seller {int} is verified with an active membership")]
async fn verified_member(world: &mut MarketplaceWorld, seller_id: i64) {
    world.market().seller(seller_id, true, true).await;
}

#[given(expr = "seller {int} has disabled payouts")]
async fn payouts_disabled(world: &mut MarketplaceWorld, seller_id: i64) {
    let db = &world.market().db;
    let profile = db.fetch_seller_profile(seller_id).await.unwrap().expect("Seller profile does not exist");
    let profile = SellerProfile { payout_enabled: false, ..profile };
    db.upsert_seller_profile(&profile).await.unwrap();
}

#[given(expr = "seller {int} lists {string} for {word}")]
async fn list_product(world: &mut MarketplaceWorld, seller_id: i64, title: String, price: String) {
    let price = price.parse::<Money>().expect("Not a valid price");
    let market = world.market();
    if market.db.fetch_seller_profile(seller_id).await.unwrap().is_none() {
        market.seller(seller_id, false, false).await;
    }
    let product = market.product(seller_id, &title, price.cents()).await;
    world.products.insert(title, product);
}

#[given("the provider refuses refunds")]
async fn refuse_refunds(world: &mut MarketplaceWorld) {
    world.market().gateway.fail_refunds(true);
}

#[given("the provider refuses payouts")]
async fn refuse_payouts(world: &mut MarketplaceWorld) {
    world.market().gateway.fail_transfers(true);
}
