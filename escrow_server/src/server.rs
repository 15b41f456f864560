use std::time::Duration;

use actix_web::{dev::Server, http::KeepAlive, middleware::Logger, web, App, HttpServer};
use escrow_engine::{
    gateway::{GatewayRegistry, ProviderRegistry},
    EscrowApi,
    MarketplaceDatabase,
    OrderFlowApi,
    ReconciliationScheduler,
    SqliteDatabase,
    WebhookProcessor,
};
use log::*;

use crate::{
    auth::AccessConfig,
    config::ServerConfig,
    errors::ServerError,
    integrations::notifications::create_notification_event_handlers,
    reconciliation_worker::start_reconciliation_worker,
    routes::{
        health,
        CancelOrderRoute,
        ConfirmPaymentRoute,
        CreateOrderRoute,
        ItemLedgerRoute,
        OrderDetailsRoute,
        ProviderWebhookRoute,
        RetryTransferRoute,
        UpdateItemStatusRoute,
    },
};

pub async fn run_server(config: ServerConfig) -> Result<(), ServerError> {
    let db = SqliteDatabase::new_with_url(&config.database_url, 25)
        .await
        .map_err(|e| ServerError::InitializeError(e.to_string()))?;
    db.migrate().await.map_err(|e| ServerError::InitializeError(e.to_string()))?;
    let gateways = ProviderRegistry::from_config(config.card.clone(), config.qr.clone())
        .map_err(|e| ServerError::ConfigurationError(e.to_string()))?;
    info!("💻️ Payment methods available: {:?}", gateways.configured_methods());

    let handlers = create_notification_event_handlers();
    let producers = handlers.producers();
    handlers.start_handlers().await;

    let orders = OrderFlowApi::new(db.clone(), gateways.clone(), producers.clone()).with_fee_defaults(config.fees);
    let escrow =
        EscrowApi::new(db, gateways, producers).with_holding_period(config.reconciliation.holding_period);
    let scheduler = ReconciliationScheduler::new(orders.clone(), escrow.clone(), config.reconciliation);
    let _worker = start_reconciliation_worker(scheduler, config.reconciliation_interval);

    let srv = create_server_instance(config, orders, escrow)?;
    srv.await.map_err(|e| ServerError::Unspecified(e.to_string()))
}

pub fn create_server_instance(
    config: ServerConfig,
    orders: OrderFlowApi<SqliteDatabase, ProviderRegistry>,
    escrow: EscrowApi<SqliteDatabase, ProviderRegistry>,
) -> Result<Server, ServerError> {
    let access = AccessConfig { admin_key: config.admin_key.clone() };
    let srv = HttpServer::new(move || {
        let webhooks = WebhookProcessor::new(orders.clone(), escrow.clone());
        App::new()
            .wrap(Logger::new("%t (%D ms) %s %a %{Host}i %U").log_target("mkt::access_log"))
            .app_data(web::Data::new(orders.clone()))
            .app_data(web::Data::new(escrow.clone()))
            .app_data(web::Data::new(webhooks))
            .app_data(web::Data::new(access.clone()))
            .configure(configure_routes::<SqliteDatabase, ProviderRegistry>)
    })
    .keep_alive(KeepAlive::Timeout(Duration::from_secs(600)))
    .bind((config.host.as_str(), config.port))?
    .run();
    Ok(srv)
}

/// Registers every route. The API objects for `B` and `G` must already be registered as app data.
pub fn configure_routes<B, G>(cfg: &mut web::ServiceConfig)
where
    B: MarketplaceDatabase + 'static,
    G: GatewayRegistry + 'static,
{
    let api_scope = web::scope("/api")
        .service(CreateOrderRoute::<B, G>::new())
        .service(OrderDetailsRoute::<B, G>::new())
        .service(ConfirmPaymentRoute::<B, G>::new())
        .service(CancelOrderRoute::<B, G>::new())
        .service(UpdateItemStatusRoute::<B, G>::new())
        .service(ItemLedgerRoute::<B, G>::new())
        .service(RetryTransferRoute::<B, G>::new());
    cfg.service(health).service(api_scope).service(ProviderWebhookRoute::<B, G>::new());
}
