use sqlx::SqliteConnection;

use crate::{db_types::FeeTier, traits::MarketplaceDbError};

/// All fee tiers, ordered by their lower bound.
pub async fn fetch_fee_tiers(conn: &mut SqliteConnection) -> Result<Vec<FeeTier>, MarketplaceDbError> {
    let tiers = sqlx::query_as("SELECT * FROM fee_tiers ORDER BY min_amount ASC, id ASC").fetch_all(conn).await?;
    Ok(tiers)
}

/// Replaces the whole fee schedule.
pub async fn replace_fee_tiers(tiers: &[FeeTier], conn: &mut SqliteConnection) -> Result<(), MarketplaceDbError> {
    sqlx::query("DELETE FROM fee_tiers").execute(&mut *conn).await?;
    for tier in tiers {
        sqlx::query(
            r#"INSERT INTO fee_tiers (min_amount, max_amount, base_rate, legit_discount, membership_discount)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(tier.min_amount)
        .bind(tier.max_amount)
        .bind(tier.base_rate)
        .bind(tier.legit_discount)
        .bind(tier.membership_discount)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}
