//! An in-memory payment provider for tests.
//!
//! Every clone shares the same state, so a test can keep a handle, script failures and inspect the calls the engine
//! made. The mock serves every payment method, and acts as its own [`GatewayRegistry`]. Like a real provider, it
//! applies a refund or payout once per idempotency key.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use market_common::Money;

use crate::{
    db_types::PaymentMethod,
    gateway::{
        signature::{calculate_hmac, verify_hmac},
        CanonicalEvent,
        ChargeHandle,
        GatewayError,
        GatewayRegistry,
        PaymentGateway,
        TransferMetadata,
    },
};

pub const MOCK_WEBHOOK_SECRET: &[u8] = b"mock-webhook-secret";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCharge {
    pub amount: Money,
    pub order_ref: String,
    pub paid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRefund {
    pub refund_id: String,
    pub charge_id: String,
    pub amount: Money,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockTransfer {
    pub transfer_id: String,
    pub destination: String,
    pub amount: Money,
    pub metadata: TransferMetadata,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    charges: HashMap<String, MockCharge>,
    refunds: Vec<MockRefund>,
    transfers: Vec<MockTransfer>,
    refund_keys: HashMap<String, String>,
    transfer_keys: HashMap<String, String>,
    fail_charges: bool,
    fail_refunds: bool,
    fail_transfers: bool,
    time_out_refunds: bool,
    time_out_transfers: bool,
    unavailable: HashSet<PaymentMethod>,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{:04}", self.next_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockGateway {
    state: Arc<Mutex<MockState>>,
}

fn refused(what: &str) -> GatewayError {
    GatewayError::Rejected { status: 402, message: format!("{what} declined by mock provider") }
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("Mock gateway state is poisoned")
    }

    /// The buyer completes payment at the provider.
    pub fn mark_paid(&self, charge_id: &str) {
        if let Some(c) = self.state().charges.get_mut(charge_id) {
            c.paid = true;
        }
    }

    pub fn fail_charges(&self, fail: bool) {
        self.state().fail_charges = fail;
    }

    pub fn fail_refunds(&self, fail: bool) {
        self.state().fail_refunds = fail;
    }

    pub fn fail_transfers(&self, fail: bool) {
        self.state().fail_transfers = fail;
    }

    /// Refunds are made, but the response is lost and the caller sees a timeout.
    pub fn time_out_refunds(&self, time_out: bool) {
        self.state().time_out_refunds = time_out;
    }

    /// Payouts are made, but the response is lost and the caller sees a timeout.
    pub fn time_out_transfers(&self, time_out: bool) {
        self.state().time_out_transfers = time_out;
    }

    /// Makes the registry report `method` as unconfigured.
    pub fn disable(&self, method: PaymentMethod) {
        self.state().unavailable.insert(method);
    }

    pub fn charge(&self, charge_id: &str) -> Option<MockCharge> {
        self.state().charges.get(charge_id).cloned()
    }

    pub fn charge_count(&self) -> usize {
        self.state().charges.len()
    }

    pub fn refunds(&self) -> Vec<MockRefund> {
        self.state().refunds.clone()
    }

    pub fn transfers(&self) -> Vec<MockTransfer> {
        self.state().transfers.clone()
    }

    /// Serializes and signs an event the way [`PaymentGateway::decode_webhook`] expects it.
    pub fn sign_event(event: &CanonicalEvent) -> (Vec<u8>, String) {
        let payload = serde_json::to_vec(event).expect("Events always serialize");
        let signature = Self::sign_payload(&payload);
        (payload, signature)
    }

    pub fn sign_payload(payload: &[u8]) -> String {
        calculate_hmac(MOCK_WEBHOOK_SECRET, payload).expect("HMAC accepts any key length")
    }
}

impl PaymentGateway for MockGateway {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Card
    }

    async fn create_charge(&self, amount: Money, order_ref: &str) -> Result<ChargeHandle, GatewayError> {
        let mut state = self.state();
        if state.fail_charges {
            return Err(refused("Charge"));
        }
        let charge_id = state.next_id("ch");
        state.charges.insert(charge_id.clone(), MockCharge { amount, order_ref: order_ref.to_string(), paid: false });
        Ok(ChargeHandle { redirect: format!("https://pay.example.test/{charge_id}"), charge_id })
    }

    async fn verify_payment(&self, charge_id: &str) -> Result<bool, GatewayError> {
        self.state()
            .charges
            .get(charge_id)
            .map(|c| c.paid)
            .ok_or_else(|| GatewayError::ChargeNotFound(charge_id.to_string()))
    }

    async fn refund(&self, charge_id: &str, amount: Money, idempotency_key: &str) -> Result<String, GatewayError> {
        let mut state = self.state();
        if state.fail_refunds {
            return Err(refused("Refund"));
        }
        let refund_id = match state.refund_keys.get(idempotency_key) {
            Some(id) => id.clone(),
            None => {
                if !state.charges.contains_key(charge_id) {
                    return Err(GatewayError::ChargeNotFound(charge_id.to_string()));
                }
                let refund_id = state.next_id("re");
                state.refund_keys.insert(idempotency_key.to_string(), refund_id.clone());
                state.refunds.push(MockRefund {
                    refund_id: refund_id.clone(),
                    charge_id: charge_id.to_string(),
                    amount,
                    idempotency_key: idempotency_key.to_string(),
                });
                refund_id
            },
        };
        if state.time_out_refunds {
            return Err(GatewayError::Timeout);
        }
        Ok(refund_id)
    }

    async fn transfer_to_seller(
        &self,
        destination: &str,
        amount: Money,
        metadata: &TransferMetadata,
    ) -> Result<String, GatewayError> {
        let mut state = self.state();
        if state.fail_transfers {
            return Err(refused("Transfer"));
        }
        let key = metadata.idempotency_key();
        let transfer_id = match state.transfer_keys.get(&key) {
            Some(id) => id.clone(),
            None => {
                let transfer_id = state.next_id("tr");
                state.transfer_keys.insert(key, transfer_id.clone());
                state.transfers.push(MockTransfer {
                    transfer_id: transfer_id.clone(),
                    destination: destination.to_string(),
                    amount,
                    metadata: metadata.clone(),
                });
                transfer_id
            },
        };
        if state.time_out_transfers {
            return Err(GatewayError::Timeout);
        }
        Ok(transfer_id)
    }

    fn decode_webhook(
        &self,
        payload: &[u8],
        signature: &str,
        _now: DateTime<Utc>,
    ) -> Result<CanonicalEvent, GatewayError> {
        verify_hmac(MOCK_WEBHOOK_SECRET, payload, signature)?;
        serde_json::from_slice(payload).map_err(|_| GatewayError::UnsupportedEvent("unknown".to_string()))
    }
}

impl GatewayRegistry for MockGateway {
    type Gateway = MockGateway;

    fn gateway_for(&self, method: PaymentMethod) -> Result<&MockGateway, GatewayError> {
        if self.state().unavailable.contains(&method) {
            return Err(GatewayError::NotConfigured(method));
        }
        Ok(self)
    }
}
