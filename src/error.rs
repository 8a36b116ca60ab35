//! Application error type for the HTTP edge
//!
//! Unifies the per-layer errors (storage, gateway, settlement, webhook
//! ingestion) behind one type with HTTP status mapping, stable error codes
//! and user-facing messages.

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::payments::error::GatewayError;
use crate::payments::state::PaymentStatus;
use crate::services::payment_service::SettlementError;
use crate::services::webhook_processor::WebhookProcessorError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Domain errors (4xx)
    UnauthorizedParty,
    PaymentConflict,
    NotFound,
    InvalidTransition,
    RetryExhausted,
    InvalidSignature,
    InvalidPayload,

    // Infrastructure errors (5xx)
    DatabaseError,
    ConfigurationError,

    // External errors (502, 503, 504)
    PaymentGatewayError,
    RateLimitError,
    ExternalServiceTimeout,

    // Generic
    InternalError,
    ValidationError,
}

/// Business rule violations
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Payer or payee is not a party to the contract
    UnauthorizedParty { reason: String },
    /// An active payment already exists, or the record changed concurrently
    Conflict { reason: String },
    NotFound { entity: String, id: String },
    InvalidTransition { from: PaymentStatus, to: PaymentStatus },
    RetryExhausted { retry_count: i32, max: i32 },
}

#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Configuration { message: String },
}

#[derive(Debug, Clone)]
pub enum ExternalError {
    PaymentGateway {
        message: String,
        status: u16,
        is_retryable: bool,
    },
    RateLimit { retry_after: Option<u64> },
    Timeout { timeout_secs: u64 },
}

#[derive(Debug, Clone)]
pub enum ValidationError {
    Field {
        field: Option<String>,
        message: String,
    },
    InvalidSignature { reason: String },
    MalformedPayload { reason: String },
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::UnauthorizedParty { .. } => 403,
                DomainError::Conflict { .. } => 409,
                DomainError::NotFound { .. } => 404,
                DomainError::InvalidTransition { .. } => 409,
                DomainError::RetryExhausted { .. } => 422,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { status, .. } => *status,
                ExternalError::RateLimit { .. } => 429,
                ExternalError::Timeout { .. } => 504,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::UnauthorizedParty { .. } => ErrorCode::UnauthorizedParty,
                DomainError::Conflict { .. } => ErrorCode::PaymentConflict,
                DomainError::NotFound { .. } => ErrorCode::NotFound,
                DomainError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
                DomainError::RetryExhausted { .. } => ErrorCode::RetryExhausted,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { .. } => ErrorCode::PaymentGatewayError,
                ExternalError::RateLimit { .. } => ErrorCode::RateLimitError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::Field { .. } => ErrorCode::ValidationError,
                ValidationError::InvalidSignature { .. } => ErrorCode::InvalidSignature,
                ValidationError::MalformedPayload { .. } => ErrorCode::InvalidPayload,
            },
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::UnauthorizedParty { reason } => reason.clone(),
                DomainError::Conflict { reason } => reason.clone(),
                DomainError::NotFound { entity, id } => format!("{} '{}' not found", entity, id),
                DomainError::InvalidTransition { from, to } => {
                    format!("Payment cannot move from {} to {}", from, to)
                }
                DomainError::RetryExhausted { max, .. } => {
                    format!("Payment has already been retried {} times", max)
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { message, .. } => message.clone(),
                ExternalError::RateLimit { retry_after } => match retry_after {
                    Some(secs) => format!(
                        "Payment gateway rate limit exceeded. Please try again in {} seconds",
                        secs
                    ),
                    None => "Payment gateway rate limit exceeded. Please try again later"
                        .to_string(),
                },
                ExternalError::Timeout { timeout_secs } => format!(
                    "Payment gateway request timed out after {} seconds. Please try again",
                    timeout_secs
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::Field {
                    field: Some(field),
                    message,
                } => format!("Invalid '{}': {}", field, message),
                ValidationError::Field {
                    field: None,
                    message,
                } => message.clone(),
                ValidationError::InvalidSignature { .. } => "Invalid webhook signature".to_string(),
                ValidationError::MalformedPayload { reason } => {
                    format!("Malformed webhook payload: {}", reason)
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { is_retryable, .. } => *is_retryable,
                ExternalError::RateLimit { .. } => true,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            message: message.into(),
            is_retryable: true,
        }))
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// Conversions from layer errors

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        let kind = match &err.kind {
            DatabaseErrorKind::NotFound { entity, id } => {
                AppErrorKind::Domain(DomainError::NotFound {
                    entity: entity.clone(),
                    id: id.clone(),
                })
            }
            DatabaseErrorKind::UniqueViolation { .. } => {
                AppErrorKind::Domain(DomainError::Conflict {
                    reason: "Record already exists".to_string(),
                })
            }
            _ => AppErrorKind::Infrastructure(InfrastructureError::Database {
                message: err.to_string(),
                is_retryable: err.is_retryable(),
            }),
        };
        AppError::new(kind)
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let kind = match &err {
            GatewayError::Validation { message, field } => {
                AppErrorKind::Validation(ValidationError::Field {
                    field: field.clone(),
                    message: message.clone(),
                })
            }
            GatewayError::WebhookVerification { message } => {
                AppErrorKind::Validation(ValidationError::InvalidSignature {
                    reason: message.clone(),
                })
            }
            GatewayError::RateLimit {
                retry_after_seconds,
                ..
            } => AppErrorKind::External(ExternalError::RateLimit {
                retry_after: *retry_after_seconds,
            }),
            GatewayError::Timeout { seconds } => AppErrorKind::External(ExternalError::Timeout {
                timeout_secs: *seconds,
            }),
            _ => AppErrorKind::External(ExternalError::PaymentGateway {
                message: err.user_message(),
                status: err.http_status_code(),
                is_retryable: err.is_retryable(),
            }),
        };
        AppError::new(kind).with_context(err.to_string())
    }
}

impl From<SettlementError> for AppError {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::Validation { message, field } => {
                AppError::new(AppErrorKind::Validation(ValidationError::Field { field, message }))
            }
            SettlementError::Authorization(reason) => {
                AppError::new(AppErrorKind::Domain(DomainError::UnauthorizedParty { reason }))
            }
            SettlementError::Conflict(reason) => {
                AppError::new(AppErrorKind::Domain(DomainError::Conflict { reason }))
            }
            SettlementError::NotFound { entity, id } => {
                AppError::new(AppErrorKind::Domain(DomainError::NotFound {
                    entity: entity.to_string(),
                    id,
                }))
            }
            SettlementError::InvalidTransition { from, to } => {
                AppError::new(AppErrorKind::Domain(DomainError::InvalidTransition { from, to }))
            }
            SettlementError::RetryExhausted { retry_count, max } => {
                AppError::new(AppErrorKind::Domain(DomainError::RetryExhausted {
                    retry_count,
                    max,
                }))
            }
            SettlementError::Gateway(e) => e.into(),
            SettlementError::Persistence(e) => e.into(),
        }
    }
}

impl From<WebhookProcessorError> for AppError {
    fn from(err: WebhookProcessorError) -> Self {
        match err {
            WebhookProcessorError::InvalidSignature(reason) => {
                AppError::new(AppErrorKind::Validation(ValidationError::InvalidSignature {
                    reason,
                }))
            }
            WebhookProcessorError::MalformedPayload(reason) => {
                AppError::new(AppErrorKind::Validation(ValidationError::MalformedPayload {
                    reason,
                }))
            }
            WebhookProcessorError::Handler(e) => match AppError::from(e) {
                // The gateway only redelivers on 5xx; a handler failure must be one.
                err if err.status_code() < 500 => {
                    AppError::internal(err.user_message()).with_context("webhook handler")
                }
                err => err,
            },
            WebhookProcessorError::UnknownPayment(intent_id) => {
                AppError::internal(format!("payment for intent {} not yet recorded", intent_id))
            }
            WebhookProcessorError::Ledger(e) => AppError::internal(e.to_string()),
            WebhookProcessorError::Database(e) => AppError::internal(e.to_string()),
        }
    }
}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;

// ---------------------------------------------------------------------------
// HTTP response
// ---------------------------------------------------------------------------

/// Standardized error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorCode,
    pub message: String,
    pub request_id: Option<String>,
    /// ISO 8601 timestamp of the error
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ErrorResponse {
    pub fn from_app_error(error: &AppError) -> Self {
        Self {
            error: error.error_code(),
            message: error.user_message(),
            request_id: error.request_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            retryable: Some(error.is_retryable()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status_code =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status_code.is_server_error() {
            tracing::error!(
                error = ?self,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Server error occurred"
            );
        } else {
            tracing::warn!(
                error = ?self,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Client error occurred"
            );
        }

        (status_code, Json(ErrorResponse::from_app_error(&self))).into_response()
    }
}
