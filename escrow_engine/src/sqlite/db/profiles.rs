use log::*;
use sqlx::SqliteConnection;

use crate::{
    db_types::{Address, SellerProfile},
    traits::MarketplaceDbError,
};

pub async fn fetch_seller_profile(
    user_id: i64,
    conn: &mut SqliteConnection,
) -> Result<Option<SellerProfile>, MarketplaceDbError> {
    let profile =
        sqlx::query_as("SELECT * FROM seller_profiles WHERE user_id = $1").bind(user_id).fetch_optional(conn).await?;
    Ok(profile)
}

pub async fn upsert_seller_profile(
    profile: &SellerProfile,
    conn: &mut SqliteConnection,
) -> Result<SellerProfile, MarketplaceDbError> {
    let profile = sqlx::query_as(
        r#"
        INSERT INTO seller_profiles (user_id, payout_destination, payout_enabled, legit_verified, membership_active)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (user_id) DO UPDATE SET
            payout_destination = excluded.payout_destination,
            payout_enabled = excluded.payout_enabled,
            legit_verified = excluded.legit_verified,
            membership_active = excluded.membership_active
        RETURNING *
        "#,
    )
    .bind(profile.user_id)
    .bind(profile.payout_destination.as_deref())
    .bind(profile.payout_enabled)
    .bind(profile.legit_verified)
    .bind(profile.membership_active)
    .fetch_one(conn)
    .await?;
    Ok(profile)
}

/// Called once per item, when its escrow is released to the seller.
pub async fn increment_completed_transactions(
    user_id: i64,
    conn: &mut SqliteConnection,
) -> Result<(), MarketplaceDbError> {
    let result =
        sqlx::query("UPDATE seller_profiles SET completed_transactions = completed_transactions + 1 WHERE user_id = $1")
            .bind(user_id)
            .execute(conn)
            .await?;
    if result.rows_affected() == 0 {
        warn!("🗃️ Seller #{user_id} has no profile. Completed transaction count not updated.");
    }
    Ok(())
}

pub async fn fetch_address(id: i64, conn: &mut SqliteConnection) -> Result<Option<Address>, MarketplaceDbError> {
    let address = sqlx::query_as("SELECT * FROM addresses WHERE id = $1").bind(id).fetch_optional(conn).await?;
    Ok(address)
}

pub async fn insert_address(
    user_id: i64,
    formatted: &str,
    conn: &mut SqliteConnection,
) -> Result<Address, MarketplaceDbError> {
    let address = sqlx::query_as("INSERT INTO addresses (user_id, formatted) VALUES ($1, $2) RETURNING *")
        .bind(user_id)
        .bind(formatted)
        .fetch_one(conn)
        .await?;
    Ok(address)
}
