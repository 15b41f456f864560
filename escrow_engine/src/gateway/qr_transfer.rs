use std::time::Duration;

use chrono::{DateTime, Utc};
use log::*;
use market_common::{Money, Secret};
use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    db_types::PaymentMethod,
    gateway::{
        rest::RestClient,
        signature::verify_hmac,
        CanonicalEvent,
        ChargeHandle,
        GatewayError,
        PaymentGateway,
        TransferMetadata,
    },
};

#[derive(Debug, Clone)]
pub struct QrTransferGatewayConfig {
    pub api_url: String,
    pub client_id: String,
    pub api_key: Secret<String>,
    pub checksum_key: Secret<String>,
    pub timeout: Duration,
}

/// A payment-link processor. Buyers pay by bank transfer, either by following the checkout URL or by scanning the
/// QR code it returns. Responses are wrapped in a `{code, desc, data}` envelope where code `"00"` means success.
#[derive(Clone)]
pub struct QrTransferGateway {
    rest: RestClient,
    checksum_key: Secret<String>,
}

const SUCCESS_CODE: &str = "00";

#[derive(Deserialize)]
struct Envelope<T> {
    code: String,
    #[serde(default)]
    desc: String,
    data: Option<T>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewPaymentRequest<'a> {
    order_code: &'a str,
    amount: i64,
    description: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentLink {
    payment_link_id: String,
    #[serde(default)]
    checkout_url: Option<String>,
    #[serde(default)]
    qr_code: Option<String>,
}

#[derive(Deserialize)]
struct PaymentRequestStatus {
    status: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewRefund<'a> {
    amount: i64,
    reference_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefundCreated {
    refund_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewPayout<'a> {
    reference_id: String,
    amount: i64,
    to_account: &'a str,
    description: String,
}

#[derive(Deserialize)]
struct PayoutCreated {
    id: String,
}

#[derive(Deserialize)]
struct WebhookBody {
    id: String,
    event: String,
    data: WebhookData,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookData {
    #[serde(default)]
    payment_link_id: Option<String>,
    #[serde(default)]
    payout_id: Option<String>,
    #[serde(default)]
    reference_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Payout references take the form `{order_item_id}:{order_ref}`.
fn payout_reference(metadata: &TransferMetadata) -> String {
    format!("{}:{}", metadata.order_item_id, metadata.order_ref)
}

fn item_from_reference(reference: Option<&str>) -> Result<i64, GatewayError> {
    reference
        .and_then(|r| r.split_once(':'))
        .and_then(|(id, _)| id.parse::<i64>().ok())
        .ok_or_else(|| GatewayError::InvalidResponse("Payout event has no usable referenceId".into()))
}

impl QrTransferGateway {
    pub fn new(config: QrTransferGatewayConfig) -> Result<Self, GatewayError> {
        let headers = [("x-client-id", config.client_id.as_str()), ("x-api-key", config.api_key.reveal().as_str())];
        let rest = RestClient::new(&config.api_url, &headers, config.timeout)?;
        Ok(Self { rest, checksum_key: config.checksum_key })
    }

    async fn call<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        idempotency_key: Option<&str>,
    ) -> Result<Option<T>, GatewayError> {
        let response = match idempotency_key {
            Some(key) => self.rest.send_idempotent::<Envelope<T>, B>(method, path, body, key).await?,
            None => self.rest.send::<Envelope<T>, B>(method, path, body).await?,
        };
        let envelope = match response {
            Some(e) => e,
            None => return Ok(None),
        };
        if envelope.code != SUCCESS_CODE {
            return Err(GatewayError::Rejected { status: 200, message: format!("{} {}", envelope.code, envelope.desc) });
        }
        envelope.data.map(Some).ok_or_else(|| GatewayError::InvalidResponse(format!("{path} returned no data")))
    }
}

impl PaymentGateway for QrTransferGateway {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::QrTransfer
    }

    async fn create_charge(&self, amount: Money, order_ref: &str) -> Result<ChargeHandle, GatewayError> {
        let body = NewPaymentRequest { order_code: order_ref, amount: amount.cents(), description: format!("Order {order_ref}") };
        let link = self
            .call::<PaymentLink, _>(Method::POST, "/v2/payment-requests", Some(&body), None)
            .await?
            .ok_or_else(|| GatewayError::InvalidResponse("Payment request endpoint not found".into()))?;
        debug!("💳️ Opened QR payment request {} for order {order_ref} ({amount})", link.payment_link_id);
        let redirect = link.checkout_url.or(link.qr_code).unwrap_or_default();
        Ok(ChargeHandle { charge_id: link.payment_link_id, redirect })
    }

    async fn verify_payment(&self, charge_id: &str) -> Result<bool, GatewayError> {
        let path = format!("/v2/payment-requests/{charge_id}");
        let status = self
            .call::<PaymentRequestStatus, ()>(Method::GET, &path, None, None)
            .await?
            .ok_or_else(|| GatewayError::ChargeNotFound(charge_id.to_string()))?;
        trace!("💳️ Payment request {charge_id} has status {}", status.status);
        Ok(status.status.eq_ignore_ascii_case("PAID"))
    }

    async fn refund(&self, charge_id: &str, amount: Money, idempotency_key: &str) -> Result<String, GatewayError> {
        let path = format!("/v2/payment-requests/{charge_id}/refunds");
        let body = NewRefund { amount: amount.cents(), reference_id: idempotency_key };
        let refund = self
            .call::<RefundCreated, _>(Method::POST, &path, Some(&body), Some(idempotency_key))
            .await?
            .ok_or_else(|| GatewayError::ChargeNotFound(charge_id.to_string()))?;
        info!("💳️ Refunded {amount} of QR payment {charge_id}. Refund id {}", refund.refund_id);
        Ok(refund.refund_id)
    }

    async fn transfer_to_seller(
        &self,
        destination: &str,
        amount: Money,
        metadata: &TransferMetadata,
    ) -> Result<String, GatewayError> {
        let body = NewPayout {
            reference_id: payout_reference(metadata),
            amount: amount.cents(),
            to_account: destination,
            description: format!("Payout for order {}", metadata.order_ref),
        };
        let payout = self
            .call::<PayoutCreated, _>(Method::POST, "/v1/payouts", Some(&body), Some(&metadata.idempotency_key()))
            .await?
            .ok_or_else(|| GatewayError::InvalidResponse("Payout endpoint not found".into()))?;
        info!("💳️ Paid out {amount} to {destination} for item #{}. Payout id {}", metadata.order_item_id, payout.id);
        Ok(payout.id)
    }

    /// Checksums cover the body only, so `now` plays no part in verification.
    fn decode_webhook(
        &self,
        payload: &[u8],
        signature: &str,
        _now: DateTime<Utc>,
    ) -> Result<CanonicalEvent, GatewayError> {
        verify_hmac(self.checksum_key.reveal().as_bytes(), payload, signature)?;
        let body = serde_json::from_slice::<WebhookBody>(payload)
            .map_err(|e| GatewayError::InvalidResponse(format!("Webhook payload is not valid. {e}")))?;
        let WebhookBody { id: event_id, event, data } = body;
        trace!("💳️ QR webhook {event_id} of type {event}");
        let charge_id = || {
            data.payment_link_id
                .clone()
                .ok_or_else(|| GatewayError::InvalidResponse("Payment event has no paymentLinkId".into()))
        };
        let payout_id = || {
            data.payout_id.clone().ok_or_else(|| GatewayError::InvalidResponse("Payout event has no payoutId".into()))
        };
        let event = match event.as_str() {
            "payment.paid" => CanonicalEvent::PaymentSucceeded { event_id, charge_id: charge_id()? },
            "payment.failed" | "payment.expired" => {
                CanonicalEvent::PaymentFailed { event_id, charge_id: charge_id()?, reason: data.reason.clone() }
            },
            "payment.disputed" => CanonicalEvent::DisputeOpened { event_id, charge_id: charge_id()? },
            "payout.created" => CanonicalEvent::TransferCreated {
                event_id,
                transfer_id: payout_id()?,
                order_item_id: item_from_reference(data.reference_id.as_deref())?,
            },
            "payout.failed" => CanonicalEvent::TransferFailed {
                event_id,
                transfer_id: payout_id()?,
                order_item_id: item_from_reference(data.reference_id.as_deref())?,
                reason: data.reason.clone(),
            },
            other => return Err(GatewayError::UnsupportedEvent(other.to_string())),
        };
        Ok(event)
    }
}
