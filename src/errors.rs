use crate::api::ApiResponse;
use axum::{http::StatusCode, response::Json};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::resilience::is_transient;

/// Error taxonomy of the practice session engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Missing or invalid user identity")]
    Unauthorized,

    #[error("Quota exceeded: {reason}")]
    QuotaExceeded { reason: String },

    #[error("Not enough questions available: requested {requested}, available {available}")]
    InsufficientInventory { requested: usize, available: usize },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limit exceeded for '{action}', retry after {retry_after_secs}s")]
    RateLimited { action: String, retry_after_secs: u64 },

    #[error("Temporary failure: {0}")]
    Transient(anyhow::Error),

    #[error("Unexpected error: {0}")]
    Unexpected(anyhow::Error),
}

impl EngineError {
    pub fn session_not_found(session_id: Uuid) -> Self {
        EngineError::NotFound(format!("Session with ID '{}' not found", session_id))
    }

    /// Machine-readable reason rendered alongside the message
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Unauthorized => "unauthorized",
            EngineError::QuotaExceeded { .. } => "upgrade_required",
            EngineError::InsufficientInventory { .. } => "insufficient_inventory",
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::RateLimited { .. } => "rate_limited",
            EngineError::Transient(_) => "transient_error",
            EngineError::Unexpected(_) => "unexpected_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::Unauthorized => StatusCode::UNAUTHORIZED,
            EngineError::QuotaExceeded { .. } => StatusCode::FORBIDDEN,
            EngineError::InsufficientInventory { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            EngineError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Store errors arrive as `anyhow::Error`; retryable ones become `Transient`.
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        if is_transient(&err) {
            EngineError::Transient(err)
        } else {
            EngineError::Unexpected(err)
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::from(anyhow::Error::from(err))
    }
}

/// Error context for structured logging
#[derive(Debug)]
pub struct ErrorContext {
    pub operation: String,
    pub resource_id: Option<String>,
    pub resource_type: String,
    pub user_id: Option<Uuid>,
}

impl ErrorContext {
    pub fn new(operation: &str, resource_type: &str) -> Self {
        Self {
            operation: operation.to_string(),
            resource_id: None,
            resource_type: resource_type.to_string(),
            user_id: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.resource_id = Some(id.to_string());
        self
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

impl EngineError {
    /// Convert to an HTTP response with consistent structure and logging
    pub fn to_response_with_context(
        self,
        context: ErrorContext,
    ) -> (StatusCode, Json<ApiResponse<()>>) {
        let status = self.status();
        let code = self.code();

        let message = match &self {
            EngineError::NotFound(_) => {
                info!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    user_id = ?context.user_id,
                    error = %self,
                    "Resource not found"
                );
                format!("{} not found", context.resource_type)
            }
            EngineError::Unauthorized
            | EngineError::InvalidRequest(_)
            | EngineError::QuotaExceeded { .. }
            | EngineError::InsufficientInventory { .. }
            | EngineError::RateLimited { .. } => {
                warn!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    user_id = ?context.user_id,
                    code = code,
                    error = %self,
                    "Request rejected"
                );
                self.to_string()
            }
            EngineError::Transient(_) => {
                error!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    user_id = ?context.user_id,
                    error = %self,
                    "Transient store failure"
                );
                "Service temporarily unavailable. Please try again.".to_string()
            }
            EngineError::Unexpected(_) => {
                error!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    user_id = ?context.user_id,
                    error = %self,
                    "Internal server error"
                );
                "An internal error occurred. Please try again.".to_string()
            }
        };

        (status, Json(ApiResponse::error_with_code(message, code)))
    }
}
