//! Subscription error types.

use std::time::Duration;

use resub_core::{FieldSelectionError, PatternError};

use crate::rpc::codes;

/// Result type for subscription operations.
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

/// Errors returned synchronously by subscribe / unsubscribe / list operations.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Invalid pattern `{pattern}`: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: PatternError,
    },

    #[error("Invalid field selection: {0}")]
    InvalidFieldSelection(#[from] FieldSelectionError),

    #[error("Subscription limit of {limit} reached for connection {connection_id}")]
    SubscriptionLimitExceeded { connection_id: String, limit: usize },

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Not authorized to subscribe to {0}")]
    Unauthorized(String),

    #[error("Invalid cursor")]
    InvalidCursor,

    #[error("Subscriptions are disabled")]
    SubscriptionsDisabled,

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Resource provider error: {0}")]
    Provider(String),
}

impl SubscriptionError {
    pub fn invalid_pattern(pattern: impl Into<String>, reason: PatternError) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason,
        }
    }

    /// JSON-RPC error code reported to clients.
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidPattern { .. }
            | Self::InvalidFieldSelection(_)
            | Self::InvalidCursor
            | Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::SubscriptionLimitExceeded { .. } => codes::SUBSCRIPTION_LIMIT_EXCEEDED,
            Self::SubscriptionNotFound(_) => codes::SUBSCRIPTION_NOT_FOUND,
            Self::Unauthorized(_) => codes::UNAUTHORIZED,
            Self::SubscriptionsDisabled => codes::SUBSCRIPTIONS_DISABLED,
            Self::Provider(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Stable error name, used in error `data` and batch results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPattern { .. } => "InvalidPatternError",
            Self::InvalidFieldSelection(_) => "InvalidFieldSelection",
            Self::SubscriptionLimitExceeded { .. } => "SubscriptionLimitExceeded",
            Self::SubscriptionNotFound(_) => "SubscriptionNotFound",
            Self::Unauthorized(_) => "Unauthorized",
            Self::InvalidCursor => "InvalidCursor",
            Self::SubscriptionsDisabled => "SubscriptionsDisabled",
            Self::InvalidParams(_) => "InvalidParams",
            Self::Provider(_) => "ProviderError",
        }
    }
}

/// A pipeline stage failed for one notification.
#[derive(Debug, thiserror::Error)]
#[error("Transformer `{transformer_id}` failed: {error:#}")]
pub struct TransformerError {
    pub transformer_id: String,
    pub error: anyhow::Error,
}

/// Errors isolated to a single delivery. Never propagated past the delivery worker.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection {0} is closed")]
    ConnectionClosed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Resource read failed: {0}")]
    ResourceRead(String),

    #[error(transparent)]
    Transformer(#[from] TransformerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Delivery panicked: {0}")]
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_invalid_params() {
        let err = SubscriptionError::invalid_pattern("", PatternError::Empty);
        assert_eq!(err.code(), codes::INVALID_PARAMS);
        assert_eq!(err.kind(), "InvalidPatternError");
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn limit_error_has_its_own_code() {
        let err = SubscriptionError::SubscriptionLimitExceeded {
            connection_id: "c1".into(),
            limit: 2,
        };
        assert_eq!(err.code(), codes::SUBSCRIPTION_LIMIT_EXCEEDED);
    }

    #[test]
    fn transformer_error_names_the_stage() {
        let err = TransformerError {
            transformer_id: "enrich".into(),
            error: anyhow::anyhow!("boom"),
        };
        assert_eq!(err.to_string(), "Transformer `enrich` failed: boom");
    }
}
