use serde::{Deserialize, Serialize};

/// A provider-independent view of a webhook notification. Every variant carries the provider's event id, which is
/// used to recognise redelivered events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanonicalEvent {
    PaymentSucceeded { event_id: String, charge_id: String },
    PaymentFailed { event_id: String, charge_id: String, reason: Option<String> },
    DisputeOpened { event_id: String, charge_id: String },
    TransferCreated { event_id: String, transfer_id: String, order_item_id: i64 },
    TransferFailed { event_id: String, transfer_id: String, order_item_id: i64, reason: Option<String> },
}

impl CanonicalEvent {
    pub fn event_id(&self) -> &str {
        match self {
            CanonicalEvent::PaymentSucceeded { event_id, .. } |
            CanonicalEvent::PaymentFailed { event_id, .. } |
            CanonicalEvent::DisputeOpened { event_id, .. } |
            CanonicalEvent::TransferCreated { event_id, .. } |
            CanonicalEvent::TransferFailed { event_id, .. } => event_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CanonicalEvent::PaymentSucceeded { .. } => "PaymentSucceeded",
            CanonicalEvent::PaymentFailed { .. } => "PaymentFailed",
            CanonicalEvent::DisputeOpened { .. } => "DisputeOpened",
            CanonicalEvent::TransferCreated { .. } => "TransferCreated",
            CanonicalEvent::TransferFailed { .. } => "TransferFailed",
        }
    }
}
