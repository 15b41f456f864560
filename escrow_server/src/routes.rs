//! Request handler definitions
//!
//! Define each route and it handler here.
//! Handlers that are more than a line or two MUST go into a separate module. Keep this module neat and tidy 🙏
//!
//! A note about performance:
//! Since each worker thread processes its requests sequentially, handlers which block the current thread will cause the
//! current worker to stop processing new requests. Every handler here awaits the engine, which awaits the database
//! or the payment provider, so workers keep serving other requests in the meantime.
//!
//! Handlers are generic over the storage backend and the provider registry, so that the same routes serve the SQLite
//! backend in production and the mock provider in tests.
use actix_web::{get, web, HttpRequest, HttpResponse, Responder};
use chrono::Utc;
use escrow_engine::{
    db_types::PaymentMethod,
    gateway::GatewayRegistry,
    order_objects::{Actor, ItemStatusUpdate, NewOrderRequest, PaymentProof},
    EscrowApi,
    MarketplaceDatabase,
    OrderFlowApi,
    WebhookOutcome,
    WebhookProcessor,
};
use log::*;
use serde_json::json;

use crate::{auth::Caller, errors::ServerError};

pub const CARD_SIGNATURE_HEADER: &str = "X-Card-Signature";
pub const QR_SIGNATURE_HEADER: &str = "X-QR-Checksum";

// Web-actix cannot handle generics in handlers, so it's implemented manually using the `route!` macro
#[macro_export]
macro_rules! route {
    ($name:ident => $method:ident $path:literal impl $($bounds:ty),+) => {
        paste::paste! { pub struct [<$name:camel Route>]< $( [< T $bounds:camel> ],)+ >( $( core::marker::PhantomData<fn() -> [< T $bounds:camel> ] >,)+ );}
        paste::paste! { impl< $( [< T $bounds:camel> ],)+ > [<$name:camel Route>]< $( [< T $bounds:camel> ],)+ > {
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self($( core::marker::PhantomData::<fn() -> [< T $bounds:camel> ] >,)+)
            }
        }}
        paste::paste! { impl<$( [< T $bounds:camel >] , )+> actix_web::dev::HttpServiceFactory for [<$name:camel Route>]<$([<T $bounds:camel>],)+>
        where
            $([<T $bounds:camel>]: $bounds + 'static,)+
        {
            fn register(self, config: &mut actix_web::dev::AppService) {
                let res = actix_web::Resource::new($path)
                    .name(stringify!($name))
                    .guard(actix_web::guard::$method())
                    .to($name::< $( [< T $bounds:camel >], )+>);
                actix_web::dev::HttpServiceFactory::register(res, config);
            }
        }}
    };
}

// ----------------------------------------------   Health  ----------------------------------------------------
#[get("/health")]
pub async fn health() -> impl Responder {
    trace!("💻️ Received health check request");
    HttpResponse::Ok().body("👍️\n")
}

//----------------------------------------------   Orders  ----------------------------------------------------
route!(create_order => Post "/orders" impl MarketplaceDatabase, GatewayRegistry);
/// Places an order for the calling user. The response carries the persisted order and whatever the client needs to
/// complete payment with the provider.
pub async fn create_order<B, G>(
    caller: Caller,
    body: web::Json<NewOrderRequest>,
    api: web::Data<OrderFlowApi<B, G>>,
) -> Result<HttpResponse, ServerError>
where
    B: MarketplaceDatabase,
    G: GatewayRegistry,
{
    let buyer_id = buyer_id(&caller)?;
    debug!("💻️ New order request from user #{buyer_id}");
    let created = api.create_order(buyer_id, body.into_inner()).await?;
    Ok(HttpResponse::Created().json(created))
}

route!(order_details => Get "/orders/{id}" impl MarketplaceDatabase, GatewayRegistry);
pub async fn order_details<B, G>(
    caller: Caller,
    path: web::Path<i64>,
    api: web::Data<OrderFlowApi<B, G>>,
) -> Result<HttpResponse, ServerError>
where
    B: MarketplaceDatabase,
    G: GatewayRegistry,
{
    let details = api.order_details(path.into_inner(), caller.actor()).await?;
    Ok(HttpResponse::Ok().json(details))
}

route!(confirm_payment => Post "/orders/{id}/confirm_payment" impl MarketplaceDatabase, GatewayRegistry);
/// The client reports that it has paid. Payment is verified with the provider before anything changes.
pub async fn confirm_payment<B, G>(
    caller: Caller,
    path: web::Path<i64>,
    body: web::Json<PaymentProof>,
    api: web::Data<OrderFlowApi<B, G>>,
) -> Result<HttpResponse, ServerError>
where
    B: MarketplaceDatabase,
    G: GatewayRegistry,
{
    let order = api.confirm_payment(path.into_inner(), caller.actor(), body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(order))
}

route!(cancel_order => Post "/orders/{id}/cancel" impl MarketplaceDatabase, GatewayRegistry);
pub async fn cancel_order<B, G>(
    caller: Caller,
    path: web::Path<i64>,
    api: web::Data<OrderFlowApi<B, G>>,
) -> Result<HttpResponse, ServerError>
where
    B: MarketplaceDatabase,
    G: GatewayRegistry,
{
    let details = api.cancel_order(path.into_inner(), caller.actor()).await?;
    Ok(HttpResponse::Ok().json(details))
}

//----------------------------------------------   Items  ----------------------------------------------------
route!(update_item_status => Post "/items/{id}/status" impl MarketplaceDatabase, GatewayRegistry);
pub async fn update_item_status<B, G>(
    caller: Caller,
    path: web::Path<i64>,
    body: web::Json<ItemStatusUpdate>,
    api: web::Data<OrderFlowApi<B, G>>,
) -> Result<HttpResponse, ServerError>
where
    B: MarketplaceDatabase,
    G: GatewayRegistry,
{
    let transition = api.update_item_status(path.into_inner(), caller.actor(), body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(transition))
}

route!(item_ledger => Get "/items/{id}/ledger" impl MarketplaceDatabase, GatewayRegistry);
pub async fn item_ledger<B, G>(
    caller: Caller,
    path: web::Path<i64>,
    api: web::Data<EscrowApi<B, G>>,
) -> Result<HttpResponse, ServerError>
where
    B: MarketplaceDatabase,
    G: GatewayRegistry,
{
    caller.require_admin()?;
    let ledger = api.ledger_for(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ledger))
}

route!(retry_transfer => Post "/items/{id}/retry_transfer" impl MarketplaceDatabase, GatewayRegistry);
/// Operator-initiated retry of a payout that failed. Failed payouts are never retried automatically.
pub async fn retry_transfer<B, G>(
    caller: Caller,
    path: web::Path<i64>,
    api: web::Data<EscrowApi<B, G>>,
) -> Result<HttpResponse, ServerError>
where
    B: MarketplaceDatabase,
    G: GatewayRegistry,
{
    caller.require_admin()?;
    let item_id = path.into_inner();
    info!("💻️ Operator retrying payout for item #{item_id}");
    let entry = api.retry_transfer(item_id).await?;
    Ok(HttpResponse::Ok().json(entry))
}

//----------------------------------------------   Webhooks  ----------------------------------------------------
route!(provider_webhook => Post "/webhook/{provider}" impl MarketplaceDatabase, GatewayRegistry);
/// Receives notifications from a payment provider.
///
/// Any 2xx response tells the provider to stop redelivering, so duplicates and ignored events are acknowledged with
/// 200. Events that could not be applied yet (e.g. a payment the provider does not confirm on query) get an error
/// status and will be redelivered.
pub async fn provider_webhook<B, G>(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
    api: web::Data<WebhookProcessor<B, G>>,
) -> Result<HttpResponse, ServerError>
where
    B: MarketplaceDatabase,
    G: GatewayRegistry,
{
    let slug = path.into_inner();
    let provider = PaymentMethod::from_slug(&slug)
        .ok_or_else(|| ServerError::NoRecordFound(format!("Unknown payment provider {slug}")))?;
    let header = signature_header(provider);
    let signature = req
        .headers()
        .get(header)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::AuthenticationError(format!("Missing {header} header")))?;
    trace!("💻️ Received {provider} webhook ({} bytes)", body.len());
    let outcome = api.process(provider, &body, signature, Utc::now()).await?;
    info!("💻️ {provider} webhook: {outcome}");
    let result = match &outcome {
        WebhookOutcome::Applied(_) => "applied",
        WebhookOutcome::Duplicate => "duplicate",
        WebhookOutcome::Ignored(_) => "ignored",
    };
    Ok(HttpResponse::Ok().json(json!({ "result": result, "detail": outcome.to_string() })))
}

pub fn signature_header(provider: PaymentMethod) -> &'static str {
    match provider {
        PaymentMethod::Card => CARD_SIGNATURE_HEADER,
        PaymentMethod::QrTransfer => QR_SIGNATURE_HEADER,
    }
}

fn buyer_id(caller: &Caller) -> Result<i64, ServerError> {
    match caller.actor() {
        Actor::User(id) => Ok(id),
        other => Err(ServerError::InsufficientPermissions(format!("Orders are placed by users, not {other}"))),
    }
}
