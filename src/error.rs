//! Error types for Turnstile.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Turnstile operations.
///
/// Rejections are not errors: a request over budget is reported through
/// [`crate::ratelimit::ConsumptionOutcome::Rejected`] and
/// [`crate::guard::Verdict::Rejected`].
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors. These are fatal at setup time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors surfaced outside the admission path
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn fail_store() -> std::result::Result<(), StoreError> {
        Err(StoreError::Connection("refused".to_string()))
    }

    fn setup() -> Result<()> {
        fail_store()?;
        Ok(())
    }

    #[test]
    fn test_store_error_converts() {
        let err = setup().unwrap_err();
        assert!(matches!(err, TurnstileError::Store(StoreError::Connection(_))));
        assert_eq!(
            err.to_string(),
            "Store error: Failed to connect to counter store: refused"
        );
    }
}
