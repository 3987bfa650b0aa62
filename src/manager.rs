//! Collaborator traits for the external transaction manager and XA
//! resources.
//!
//! This crate never executes the two-phase-commit protocol itself; an
//! [`XaTransaction`](crate::xa::XaTransaction) drives the handful of
//! contracted calls below against whatever manager the embedding
//! application provides. Timeouts cross this boundary in whole seconds.

use std::sync::Arc;

use crate::error::BoxError;
use crate::transaction::TransactionStatus;

/// The external transaction manager an XA transaction delegates to.
pub trait TransactionManager: Send + Sync {
    /// Start a new transaction on the calling thread.
    fn begin(&self) -> Result<(), BoxError>;

    /// Commit the transaction associated with the calling thread.
    fn commit(&self) -> Result<(), BoxError>;

    /// Roll back the transaction associated with the calling thread.
    fn rollback(&self) -> Result<(), BoxError>;

    /// Detach the transaction from the calling thread without ending it.
    fn suspend(&self) -> Result<(), BoxError>;

    /// Reattach a previously suspended transaction to the calling thread.
    fn resume(&self) -> Result<(), BoxError>;

    /// Set the timeout, in seconds, for transactions started after this
    /// call.
    fn set_transaction_timeout(&self, seconds: u64) -> Result<(), BoxError>;

    /// Mark the current transaction so the only possible outcome is
    /// rollback.
    fn set_rollback_only(&self) -> Result<(), BoxError>;

    /// Current status of the transaction associated with the calling
    /// thread.
    fn status(&self) -> Result<TransactionStatus, BoxError>;

    /// Enlist a resource manager in the current transaction.
    fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> Result<(), BoxError>;
}

/// A resource manager participating in an XA transaction.
pub trait XaResource: Send + Sync {
    /// Set the timeout, in seconds, for work done under this resource.
    fn set_transaction_timeout(&self, seconds: u64) -> Result<(), BoxError>;
}
