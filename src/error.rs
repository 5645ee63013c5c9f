use thiserror::Error;

/// Result type for governance operations
pub type Result<T> = std::result::Result<T, GovernorError>;

/// Errors that can occur in the governance layer
#[derive(Error, Debug)]
pub enum GovernorError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store operation timed out: {operation}")]
    Timeout { operation: &'static str },

    #[error("Unexpected store reply: {0}")]
    UnexpectedReply(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GovernorError {
    /// Whether this error means the backing store could not serve the call
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            GovernorError::Redis(_)
                | GovernorError::StoreUnavailable(_)
                | GovernorError::Timeout { .. }
                | GovernorError::UnexpectedReply(_)
        )
    }
}

impl From<config::ConfigError> for GovernorError {
    fn from(err: config::ConfigError) -> Self {
        GovernorError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failure_classification() {
        assert!(GovernorError::StoreUnavailable("down".into()).is_store_failure());
        assert!(GovernorError::Timeout { operation: "GET" }.is_store_failure());
        assert!(!GovernorError::Validation("ttl".into()).is_store_failure());
        assert!(!GovernorError::Config("missing".into()).is_store_failure());
    }
}
