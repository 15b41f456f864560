use market_common::Money;

use crate::{
    db_types::{Address, Offer, Product, SellerProfile},
    traits::MarketplaceDbError,
};

#[allow(async_fn_in_trait)]
pub trait CatalogManagement {
    async fn fetch_product(&self, product_id: i64) -> Result<Option<Product>, MarketplaceDbError>;

    /// The price of the accepted offer the buyer holds for the product, if any.
    async fn fetch_accepted_offer(&self, product_id: i64, buyer_id: i64) -> Result<Option<Offer>, MarketplaceDbError>;

    /// Lists a new product. Catalog management lives elsewhere; this is here so that deployments and tests can seed
    /// the shared datastore.
    async fn insert_product(&self, seller_id: i64, title: &str, price: Money) -> Result<Product, MarketplaceDbError>;

    async fn insert_offer(
        &self,
        product_id: i64,
        buyer_id: i64,
        price: Money,
        accepted: bool,
    ) -> Result<Offer, MarketplaceDbError>;
}

#[allow(async_fn_in_trait)]
pub trait ProfileManagement {
    async fn fetch_seller_profile(&self, user_id: i64) -> Result<Option<SellerProfile>, MarketplaceDbError>;

    async fn fetch_address(&self, address_id: i64) -> Result<Option<Address>, MarketplaceDbError>;

    /// Creates or replaces a seller profile. `completed_transactions` is preserved for existing profiles.
    async fn upsert_seller_profile(&self, profile: &SellerProfile) -> Result<SellerProfile, MarketplaceDbError>;

    async fn insert_address(&self, user_id: i64, formatted: &str) -> Result<Address, MarketplaceDbError>;
}
