use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::{db_types::PaymentMethod, traits::MarketplaceDbError};

pub async fn is_processed(
    provider: PaymentMethod,
    event_id: &str,
    conn: &mut SqliteConnection,
) -> Result<bool, MarketplaceDbError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_webhooks WHERE provider = $1 AND event_id = $2")
        .bind(provider.slug())
        .bind(event_id)
        .fetch_one(conn)
        .await?;
    Ok(count > 0)
}

/// Returns `false` if the event was already recorded.
pub async fn mark_processed(
    provider: PaymentMethod,
    event_id: &str,
    event_type: &str,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<bool, MarketplaceDbError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO processed_webhooks (provider, event_id, event_type, processed_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(provider.slug())
    .bind(event_id)
    .bind(event_type)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}
