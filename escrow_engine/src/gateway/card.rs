use std::time::Duration;

use chrono::{DateTime, Utc};
use log::*;
use market_common::{Money, Secret};
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::{
    db_types::PaymentMethod,
    gateway::{
        rest::RestClient,
        signature::{TimestampedSignature, SIGNATURE_TOLERANCE_SECS},
        CanonicalEvent,
        ChargeHandle,
        GatewayError,
        PaymentGateway,
        TransferMetadata,
    },
};

#[derive(Debug, Clone)]
pub struct CardGatewayConfig {
    pub api_url: String,
    pub api_key: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub timeout: Duration,
}

/// A card processor with a payment-intent REST API and `t=..,v1=..` signed webhooks.
#[derive(Clone)]
pub struct CardGateway {
    rest: RestClient,
    webhook_secret: Secret<String>,
}

#[derive(Serialize)]
struct NewPaymentIntent<'a> {
    amount: i64,
    metadata: OrderMetadata<'a>,
}

#[derive(Serialize)]
struct OrderMetadata<'a> {
    order_ref: &'a str,
}

#[derive(Deserialize)]
struct PaymentIntent {
    id: String,
    #[serde(default)]
    client_secret: Option<String>,
    status: String,
}

#[derive(Serialize)]
struct NewRefund<'a> {
    payment_intent: &'a str,
    amount: i64,
}

#[derive(Serialize)]
struct NewTransfer<'a> {
    amount: i64,
    destination: &'a str,
    transfer_group: &'a str,
    metadata: ItemMetadata,
}

#[derive(Serialize, Deserialize, Default)]
struct ItemMetadata {
    #[serde(default)]
    order_item_id: Option<String>,
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

#[derive(Deserialize)]
struct WebhookEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookData,
}

#[derive(Deserialize)]
struct WebhookData {
    object: WebhookObject,
}

#[derive(Deserialize)]
struct WebhookObject {
    id: String,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    metadata: ItemMetadata,
    #[serde(default)]
    failure_message: Option<String>,
    #[serde(default)]
    last_payment_error: Option<PaymentError>,
}

#[derive(Deserialize)]
struct PaymentError {
    #[serde(default)]
    message: Option<String>,
}

impl CardGateway {
    pub fn new(config: CardGatewayConfig) -> Result<Self, GatewayError> {
        let auth = format!("Bearer {}", config.api_key.reveal());
        let rest = RestClient::new(&config.api_url, &[("Authorization", auth.as_str())], config.timeout)?;
        Ok(Self { rest, webhook_secret: config.webhook_secret })
    }
}

fn item_id(metadata: &ItemMetadata) -> Result<i64, GatewayError> {
    metadata
        .order_item_id
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| GatewayError::InvalidResponse("Transfer event is missing order_item_id metadata".into()))
}

impl PaymentGateway for CardGateway {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Card
    }

    async fn create_charge(&self, amount: Money, order_ref: &str) -> Result<ChargeHandle, GatewayError> {
        let body = NewPaymentIntent { amount: amount.cents(), metadata: OrderMetadata { order_ref } };
        let intent = self
            .rest
            .send::<PaymentIntent, _>(Method::POST, "/v1/payment_intents", Some(&body))
            .await?
            .ok_or_else(|| GatewayError::InvalidResponse("Payment intent endpoint not found".into()))?;
        debug!("💳️ Opened card payment intent {} for order {order_ref} ({amount})", intent.id);
        Ok(ChargeHandle { charge_id: intent.id, redirect: intent.client_secret.unwrap_or_default() })
    }

    async fn verify_payment(&self, charge_id: &str) -> Result<bool, GatewayError> {
        let path = format!("/v1/payment_intents/{charge_id}");
        let intent = self
            .rest
            .send::<PaymentIntent, ()>(Method::GET, &path, None)
            .await?
            .ok_or_else(|| GatewayError::ChargeNotFound(charge_id.to_string()))?;
        trace!("💳️ Payment intent {} has status {}", intent.id, intent.status);
        Ok(intent.status == "succeeded")
    }

    async fn refund(&self, charge_id: &str, amount: Money, idempotency_key: &str) -> Result<String, GatewayError> {
        let body = NewRefund { payment_intent: charge_id, amount: amount.cents() };
        let refund = self
            .rest
            .send_idempotent::<Created, _>(Method::POST, "/v1/refunds", Some(&body), idempotency_key)
            .await
            .map_err(|e| match e {
                GatewayError::Rejected { status: 400, message } if message.contains("resource_missing") => {
                    GatewayError::ChargeNotFound(charge_id.to_string())
                },
                e => e,
            })?;
        let refund = refund.ok_or_else(|| GatewayError::ChargeNotFound(charge_id.to_string()))?;
        info!("💳️ Refunded {amount} of card charge {charge_id}. Refund id {}", refund.id);
        Ok(refund.id)
    }

    async fn transfer_to_seller(
        &self,
        destination: &str,
        amount: Money,
        metadata: &TransferMetadata,
    ) -> Result<String, GatewayError> {
        let body = NewTransfer {
            amount: amount.cents(),
            destination,
            transfer_group: &metadata.order_ref,
            metadata: ItemMetadata { order_item_id: Some(metadata.order_item_id.to_string()) },
        };
        let transfer = self
            .rest
            .send_idempotent::<Created, _>(Method::POST, "/v1/transfers", Some(&body), &metadata.idempotency_key())
            .await?
            .ok_or_else(|| GatewayError::InvalidResponse("Transfer endpoint not found".into()))?;
        info!("💳️ Transferred {amount} to {destination} for item #{}. Transfer id {}", metadata.order_item_id, transfer.id);
        Ok(transfer.id)
    }

    fn decode_webhook(
        &self,
        payload: &[u8],
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<CanonicalEvent, GatewayError> {
        let tolerance = chrono::Duration::seconds(SIGNATURE_TOLERANCE_SECS);
        TimestampedSignature::parse(signature)?.verify(self.webhook_secret.reveal().as_bytes(), payload, now, tolerance)?;
        let envelope = serde_json::from_slice::<WebhookEnvelope>(payload)
            .map_err(|e| GatewayError::InvalidResponse(format!("Webhook payload is not valid. {e}")))?;
        let WebhookEnvelope { id: event_id, event_type, data: WebhookData { object } } = envelope;
        trace!("💳️ Card webhook {event_id} of type {event_type}");
        let event = match event_type.as_str() {
            "payment_intent.succeeded" => CanonicalEvent::PaymentSucceeded { event_id, charge_id: object.id },
            "payment_intent.payment_failed" => CanonicalEvent::PaymentFailed {
                event_id,
                charge_id: object.id,
                reason: object.last_payment_error.and_then(|e| e.message),
            },
            "charge.dispute.created" => {
                let charge_id = object
                    .payment_intent
                    .ok_or_else(|| GatewayError::InvalidResponse("Dispute event has no payment_intent".into()))?;
                CanonicalEvent::DisputeOpened { event_id, charge_id }
            },
            "transfer.created" => {
                let order_item_id = item_id(&object.metadata)?;
                CanonicalEvent::TransferCreated { event_id, transfer_id: object.id, order_item_id }
            },
            "transfer.failed" | "transfer.reversed" => {
                let order_item_id = item_id(&object.metadata)?;
                CanonicalEvent::TransferFailed {
                    event_id,
                    transfer_id: object.id,
                    order_item_id,
                    reason: object.failure_message,
                }
            },
            other => return Err(GatewayError::UnsupportedEvent(other.to_string())),
        };
        Ok(event)
    }
}
