use actix_web::{
    error::ResponseError,
    http::{header::ContentType, StatusCode},
    HttpResponse,
};
use escrow_engine::{gateway::GatewayError, MarketplaceDbError, OrderFlowError};
use log::error;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Could not initialize server. {0}")]
    InitializeError(String),
    #[error("Invalid server configuration. {0}")]
    ConfigurationError(String),
    #[error("An I/O error happened in the server. {0}")]
    IOError(#[from] std::io::Error),
    #[error("Could not read request body: {0}")]
    InvalidRequestBody(String),
    #[error("Authentication Error. {0}")]
    AuthenticationError(String),
    #[error("Insufficient Permissions. {0}")]
    InsufficientPermissions(String),
    #[error("The data was not found. {0}")]
    NoRecordFound(String),
    #[error("{0}")]
    OrderFlow(#[from] OrderFlowError),
    #[error("UnspecifiedError. {0}")]
    Unspecified(String),
}

impl From<MarketplaceDbError> for ServerError {
    fn from(e: MarketplaceDbError) -> Self {
        Self::OrderFlow(e.into())
    }
}

impl ResponseError for ServerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InitializeError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ConfigurationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::IOError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unspecified(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidRequestBody(_) => StatusCode::BAD_REQUEST,
            Self::AuthenticationError(_) => StatusCode::UNAUTHORIZED,
            Self::InsufficientPermissions(_) => StatusCode::FORBIDDEN,
            Self::NoRecordFound(_) => StatusCode::NOT_FOUND,
            Self::OrderFlow(e) => match e {
                OrderFlowError::Validation(_) => StatusCode::BAD_REQUEST,
                OrderFlowError::BusinessRule(_) => StatusCode::UNPROCESSABLE_ENTITY,
                OrderFlowError::NotFound(_) => StatusCode::NOT_FOUND,
                OrderFlowError::Gateway(GatewayError::InvalidSignature(_)) => StatusCode::UNAUTHORIZED,
                OrderFlowError::Gateway(_) => StatusCode::BAD_GATEWAY,
                OrderFlowError::ConcurrencyConflict(_) => StatusCode::CONFLICT,
                OrderFlowError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            error!("💻️ {self}");
        }
        HttpResponse::build(status)
            .insert_header(ContentType::json())
            .body(serde_json::json!({ "error": self.to_string() }).to_string())
    }
}
