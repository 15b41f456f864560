use thiserror::Error;

use crate::{gateway::GatewayError, traits::MarketplaceDbError};

/// Errors returned by the engine's public API. An operation that fails leaves no partial state behind.
///
/// `ConcurrencyConflict` means another writer changed the record first. Re-read it before retrying.
#[derive(Debug, Clone, Error)]
pub enum OrderFlowError {
    #[error("Invalid request. {0}")]
    Validation(String),
    #[error("{0}")]
    BusinessRule(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Payment provider error. {0}")]
    Gateway(#[from] GatewayError),
    #[error("Concurrent update detected. {0}")]
    ConcurrencyConflict(String),
    #[error("Database error. {0}")]
    Database(String),
}

impl OrderFlowError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn rule<S: Into<String>>(msg: S) -> Self {
        Self::BusinessRule(msg.into())
    }

    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound(what.into())
    }
}

impl From<MarketplaceDbError> for OrderFlowError {
    fn from(e: MarketplaceDbError) -> Self {
        match e {
            MarketplaceDbError::DatabaseError(s) => Self::Database(s),
            MarketplaceDbError::OrderNotFound(id) => Self::NotFound(format!("Order #{id}")),
            MarketplaceDbError::ItemNotFound(id) => Self::NotFound(format!("Order item #{id}")),
            MarketplaceDbError::OrderRefExists(s) => Self::ConcurrencyConflict(s),
            e @ MarketplaceDbError::IllegalItemTransition { .. } => Self::BusinessRule(e.to_string()),
            e @ MarketplaceDbError::IllegalEscrowTransition { .. } => Self::BusinessRule(e.to_string()),
            MarketplaceDbError::ConcurrencyConflict(s) => Self::ConcurrencyConflict(s),
        }
    }
}

impl From<sqlx::Error> for OrderFlowError {
    fn from(e: sqlx::Error) -> Self {
        MarketplaceDbError::from(e).into()
    }
}
