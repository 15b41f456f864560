use log::*;
use market_common::Money;
use sqlx::SqliteConnection;

use crate::{
    db_types::{Offer, OfferStatus, Product, ProductStatus},
    traits::MarketplaceDbError,
};

pub async fn fetch_product(id: i64, conn: &mut SqliteConnection) -> Result<Option<Product>, MarketplaceDbError> {
    let product = sqlx::query_as("SELECT * FROM products WHERE id = $1").bind(id).fetch_optional(conn).await?;
    Ok(product)
}

pub async fn insert_product(
    seller_id: i64,
    title: &str,
    price: Money,
    conn: &mut SqliteConnection,
) -> Result<Product, MarketplaceDbError> {
    let product = sqlx::query_as("INSERT INTO products (seller_id, title, price) VALUES ($1, $2, $3) RETURNING *")
        .bind(seller_id)
        .bind(title)
        .bind(price)
        .fetch_one(conn)
        .await?;
    Ok(product)
}

pub async fn set_product_status(
    id: i64,
    status: ProductStatus,
    conn: &mut SqliteConnection,
) -> Result<(), MarketplaceDbError> {
    let previous: Option<ProductStatus> = sqlx::query_scalar("SELECT status FROM products WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    match previous {
        None => warn!("🗃️ Product #{id} has disappeared from the catalog. Its status cannot be set to {status}"),
        Some(p) if p == status => trace!("🗃️ Product #{id} is already {status}"),
        Some(p) => {
            if status == ProductStatus::Sold && p != ProductStatus::Active {
                warn!("🗃️ Product #{id} was {p} when it was sold");
            }
            sqlx::query("UPDATE products SET status = $1 WHERE id = $2").bind(status).bind(id).execute(conn).await?;
            debug!("🗃️ Product #{id} is now {status}");
        },
    }
    Ok(())
}

/// The most recent accepted offer from `buyer_id` on `product_id`.
pub async fn fetch_accepted_offer(
    product_id: i64,
    buyer_id: i64,
    conn: &mut SqliteConnection,
) -> Result<Option<Offer>, MarketplaceDbError> {
    let offer = sqlx::query_as(
        "SELECT * FROM offers WHERE product_id = $1 AND buyer_id = $2 AND status = $3 ORDER BY id DESC LIMIT 1",
    )
    .bind(product_id)
    .bind(buyer_id)
    .bind(OfferStatus::Accepted)
    .fetch_optional(conn)
    .await?;
    Ok(offer)
}

pub async fn insert_offer(
    product_id: i64,
    buyer_id: i64,
    price: Money,
    status: OfferStatus,
    conn: &mut SqliteConnection,
) -> Result<Offer, MarketplaceDbError> {
    let offer =
        sqlx::query_as("INSERT INTO offers (product_id, buyer_id, price, status) VALUES ($1, $2, $3, $4) RETURNING *")
            .bind(product_id)
            .bind(buyer_id)
            .bind(price)
            .bind(status)
            .fetch_one(conn)
            .await?;
    Ok(offer)
}
