//! Transaction error types.

use thiserror::Error;

/// Boxed error carried back from an external collaborator
/// (transaction manager or XA resource).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors that can occur during transaction coordination.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// A programming-contract violation: binding over an already-bound
    /// thread, suspending with nothing active, resuming with nothing
    /// suspended, double-resume, and similar control-flow bugs in the
    /// caller. Always propagated, never swallowed.
    #[error("illegal transaction state: {0}")]
    IllegalState(String),

    /// An underlying protocol call against the transaction manager or an
    /// enlisted resource failed.
    #[error("transaction {operation} failed: {source}")]
    Failure {
        /// The protocol call that failed (`begin`, `commit`, ...).
        operation: &'static str,
        /// The collaborator's own error.
        #[source]
        source: BoxError,
    },
}

impl TransactionError {
    /// Create an [`TransactionError::IllegalState`] error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// Wrap a collaborator failure for the given protocol call.
    pub fn failure(operation: &'static str, source: BoxError) -> Self {
        Self::Failure { operation, source }
    }

    /// Check whether this error is a caller contract violation.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState(_))
    }
}
