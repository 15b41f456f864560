//! A ready-made marketplace on a fresh database, wired to a [`MockGateway`].
use log::*;
use market_common::Money;
use sqlx::{migrate::MigrateDatabase, Sqlite};

use crate::{
    db_types::{Address, Product, SellerProfile},
    events::EventProducers,
    test_utils::{
        mock_gateway::MockGateway,
        prepare_env::{prepare_test_env, random_db_path},
    },
    traits::{CatalogManagement, ProfileManagement},
    EscrowApi,
    MarketplaceDatabase,
    OrderFlowApi,
    ReconciliationConfig,
    ReconciliationScheduler,
    SqliteDatabase,
    WebhookProcessor,
};

pub type TestOrderApi = OrderFlowApi<SqliteDatabase, MockGateway>;
pub type TestEscrowApi = EscrowApi<SqliteDatabase, MockGateway>;

#[derive(Debug, Clone)]
pub struct TestMarketplace {
    pub db_path: String,
    pub db: SqliteDatabase,
    pub gateway: MockGateway,
    pub orders: TestOrderApi,
    pub escrow: TestEscrowApi,
}

impl TestMarketplace {
    pub async fn new() -> Self {
        Self::with_producers(EventProducers::default()).await
    }

    pub async fn with_producers(producers: EventProducers) -> Self {
        let db_path = random_db_path();
        prepare_test_env(&db_path).await;
        let db = SqliteDatabase::new_with_url(&db_path, 5).await.expect("Error creating connection to database");
        let gateway = MockGateway::new();
        let orders = OrderFlowApi::new(db.clone(), gateway.clone(), producers.clone());
        let escrow = EscrowApi::new(db.clone(), gateway.clone(), producers);
        Self { db_path, db, gateway, orders, escrow }
    }

    pub fn webhooks(&self) -> WebhookProcessor<SqliteDatabase, MockGateway> {
        WebhookProcessor::new(self.orders.clone(), self.escrow.clone())
    }

    pub fn reconciliation(&self, config: ReconciliationConfig) -> ReconciliationScheduler<SqliteDatabase, MockGateway> {
        ReconciliationScheduler::new(self.orders.clone(), self.escrow.clone(), config)
    }

    /// A seller who can receive payouts at `acct_<user_id>`.
    pub async fn seller(&self, user_id: i64, legit_verified: bool, membership_active: bool) -> SellerProfile {
        let profile = SellerProfile {
            user_id,
            payout_destination: Some(format!("acct_{user_id}")),
            payout_enabled: true,
            legit_verified,
            membership_active,
            completed_transactions: 0,
        };
        self.db.upsert_seller_profile(&profile).await.expect("Error saving seller profile")
    }

    pub async fn product(&self, seller_id: i64, title: &str, cents: i64) -> Product {
        self.db.insert_product(seller_id, title, Money::from_cents(cents)).await.expect("Error saving product")
    }

    pub async fn address(&self, user_id: i64) -> Address {
        let formatted = format!("{user_id} Market Street, Springfield");
        self.db.insert_address(user_id, &formatted).await.expect("Error saving address")
    }

    /// Closes the pool and deletes the database file.
    pub async fn tear_down(self) {
        let Self { mut db, db_path, .. } = self;
        if let Err(e) = db.close().await {
            error!("🚀️ Failed to close database: {e}");
        }
        if let Err(e) = Sqlite::drop_database(&db_path).await {
            warn!("🚀️ Could not remove test database {db_path}: {e}");
        }
    }
}
