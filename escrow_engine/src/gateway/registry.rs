use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::*;
use market_common::Money;

use crate::{
    db_types::PaymentMethod,
    gateway::{
        CanonicalEvent,
        CardGateway,
        CardGatewayConfig,
        ChargeHandle,
        GatewayError,
        PaymentGateway,
        QrTransferGateway,
        QrTransferGatewayConfig,
        TransferMetadata,
    },
};

/// Maps a payment method to the provider that handles it.
pub trait GatewayRegistry: Clone {
    type Gateway: PaymentGateway;

    /// Returns the provider for `method`, or [`GatewayError::NotConfigured`] if there isn't one.
    fn gateway_for(&self, method: PaymentMethod) -> Result<&Self::Gateway, GatewayError>;
}

/// One of the built-in providers.
#[derive(Clone)]
pub enum Provider {
    Card(CardGateway),
    QrTransfer(QrTransferGateway),
}

impl PaymentGateway for Provider {
    fn method(&self) -> PaymentMethod {
        match self {
            Provider::Card(g) => g.method(),
            Provider::QrTransfer(g) => g.method(),
        }
    }

    async fn create_charge(&self, amount: Money, order_ref: &str) -> Result<ChargeHandle, GatewayError> {
        match self {
            Provider::Card(g) => g.create_charge(amount, order_ref).await,
            Provider::QrTransfer(g) => g.create_charge(amount, order_ref).await,
        }
    }

    async fn verify_payment(&self, charge_id: &str) -> Result<bool, GatewayError> {
        match self {
            Provider::Card(g) => g.verify_payment(charge_id).await,
            Provider::QrTransfer(g) => g.verify_payment(charge_id).await,
        }
    }

    async fn refund(&self, charge_id: &str, amount: Money, idempotency_key: &str) -> Result<String, GatewayError> {
        match self {
            Provider::Card(g) => g.refund(charge_id, amount, idempotency_key).await,
            Provider::QrTransfer(g) => g.refund(charge_id, amount, idempotency_key).await,
        }
    }

    async fn transfer_to_seller(
        &self,
        destination: &str,
        amount: Money,
        metadata: &TransferMetadata,
    ) -> Result<String, GatewayError> {
        match self {
            Provider::Card(g) => g.transfer_to_seller(destination, amount, metadata).await,
            Provider::QrTransfer(g) => g.transfer_to_seller(destination, amount, metadata).await,
        }
    }

    fn decode_webhook(
        &self,
        payload: &[u8],
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<CanonicalEvent, GatewayError> {
        match self {
            Provider::Card(g) => g.decode_webhook(payload, signature, now),
            Provider::QrTransfer(g) => g.decode_webhook(payload, signature, now),
        }
    }
}

/// The configuration-driven registry used by the server.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<PaymentMethod, Provider>,
}

impl ProviderRegistry {
    /// Builds a registry from whichever provider configurations are present. A method with no configuration is
    /// left out, and orders using it fail with [`GatewayError::NotConfigured`].
    pub fn from_config(
        card: Option<CardGatewayConfig>,
        qr: Option<QrTransferGatewayConfig>,
    ) -> Result<Self, GatewayError> {
        let mut registry = Self::default();
        if let Some(config) = card {
            info!("💳️ Card payments enabled via {}", config.api_url);
            registry = registry.with_provider(Provider::Card(CardGateway::new(config)?));
        }
        if let Some(config) = qr {
            info!("💳️ QR transfer payments enabled via {}", config.api_url);
            registry = registry.with_provider(Provider::QrTransfer(QrTransferGateway::new(config)?));
        }
        if registry.providers.is_empty() {
            warn!("💳️ No payment providers are configured. Every order will be rejected.");
        }
        Ok(registry)
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.providers.insert(provider.method(), provider);
        self
    }

    pub fn configured_methods(&self) -> Vec<PaymentMethod> {
        let mut methods = self.providers.keys().copied().collect::<Vec<_>>();
        methods.sort_by_key(|m| m.slug());
        methods
    }
}

impl GatewayRegistry for ProviderRegistry {
    type Gateway = Provider;

    fn gateway_for(&self, method: PaymentMethod) -> Result<&Provider, GatewayError> {
        self.providers.get(&method).ok_or(GatewayError::NotConfigured(method))
    }
}
