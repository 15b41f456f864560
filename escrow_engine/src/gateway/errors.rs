use thiserror::Error;

use crate::db_types::PaymentMethod;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("No payment provider is configured for {0} payments")]
    NotConfigured(PaymentMethod),
    #[error("Could not initialize the payment provider client. {0}")]
    Initialization(String),
    #[error("Could not reach the payment provider. {0}")]
    Network(String),
    #[error("The payment provider did not respond in time")]
    Timeout,
    #[error("The payment provider rejected the request. Error {status}. {message}")]
    Rejected { status: u16, message: String },
    #[error("The payment provider has no record of charge {0}")]
    ChargeNotFound(String),
    #[error("Could not decode the payment provider's response. {0}")]
    InvalidResponse(String),
    #[error("Webhook signature verification failed. {0}")]
    InvalidSignature(String),
    #[error("Webhook event type {0} is not handled")]
    UnsupportedEvent(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout
        } else if e.is_decode() {
            GatewayError::InvalidResponse(e.to_string())
        } else {
            GatewayError::Network(e.to_string())
        }
    }
}
