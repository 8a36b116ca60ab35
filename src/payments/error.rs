use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Payment declined: {message}")]
    Declined {
        message: String,
        gateway_code: Option<String>,
    },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Gateway call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Webhook verification failed: {message}")]
    WebhookVerification { message: String },

    #[error("Invalid gateway response: {message}")]
    InvalidResponse { message: String },

    #[error("Gateway error: {message}")]
    Provider {
        message: String,
        gateway_code: Option<String>,
        retryable: bool,
    },

    #[error("Not found at gateway: {resource}")]
    NotFound { resource: String },
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Validation { .. } => false,
            GatewayError::Declined { .. } => false,
            GatewayError::Network { .. } => true,
            GatewayError::Timeout { .. } => true,
            GatewayError::RateLimit { .. } => true,
            GatewayError::WebhookVerification { .. } => false,
            GatewayError::InvalidResponse { .. } => false,
            GatewayError::Provider { retryable, .. } => *retryable,
            GatewayError::NotFound { .. } => false,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            GatewayError::Validation { .. } => 400,
            GatewayError::Declined { .. } => 402,
            GatewayError::Network { .. } => 503,
            GatewayError::Timeout { .. } => 504,
            GatewayError::RateLimit { .. } => 429,
            GatewayError::WebhookVerification { .. } => 400,
            GatewayError::InvalidResponse { .. } => 502,
            GatewayError::Provider { .. } => 502,
            GatewayError::NotFound { .. } => 404,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Validation { message, .. } => message.clone(),
            GatewayError::Declined { .. } => "Payment was declined by the gateway".to_string(),
            GatewayError::Network { .. } | GatewayError::Timeout { .. } => {
                "Payment gateway is temporarily unavailable".to_string()
            }
            GatewayError::RateLimit { .. } => {
                "Too many requests to payment gateway. Please retry shortly".to_string()
            }
            GatewayError::WebhookVerification { .. } => "Invalid webhook signature".to_string(),
            GatewayError::InvalidResponse { .. } | GatewayError::Provider { .. } => {
                "Payment gateway returned an error".to_string()
            }
            GatewayError::NotFound { .. } => "Payment not found at gateway".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_http_status_mapping_is_correct() {
        assert_eq!(
            GatewayError::Validation {
                message: "bad".to_string(),
                field: None
            }
            .http_status_code(),
            400
        );
        assert_eq!(
            GatewayError::RateLimit {
                message: "limited".to_string(),
                retry_after_seconds: Some(30)
            }
            .http_status_code(),
            429
        );
        assert_eq!(GatewayError::Timeout { seconds: 15 }.http_status_code(), 504);
    }

    #[test]
    fn retryable_flags_are_set() {
        assert!(GatewayError::Network {
            message: "reset".to_string()
        }
        .is_retryable());
        assert!(GatewayError::Timeout { seconds: 15 }.is_retryable());
        assert!(!GatewayError::Declined {
            message: "declined".to_string(),
            gateway_code: None
        }
        .is_retryable());
    }
}
