//! txcoord - Thread-Bound Transaction Coordination
//!
//! This crate tracks at most one active logical transaction per thread,
//! with a LIFO stack of suspended transactions per thread for nested
//! units of work, and manages XA-style multi-resource transactions
//! (resource enlistment, timeout propagation, commit/rollback
//! resolution). The two-phase-commit protocol itself lives behind the
//! [`TransactionManager`](manager::TransactionManager) collaborator.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use txcoord::{LocalTransaction, NullNotificationDispatcher, Transaction, TransactionCoordinator};
//!
//! let coordinator = TransactionCoordinator::new();
//! let tx: Arc<dyn Transaction> =
//!     Arc::new(LocalTransaction::new("orders", Arc::new(NullNotificationDispatcher)));
//!
//! tx.begin().unwrap();
//! coordinator.bind_transaction(tx.clone()).unwrap();
//! // ... unit of work runs under `tx` ...
//! coordinator.resolve_transaction().unwrap();
//! ```

pub mod coordination;
pub mod error;
pub mod manager;
pub mod notification;
pub mod resources;
pub mod transaction;
pub mod xa;

pub use coordination::TransactionCoordinator;
pub use error::{BoxError, TransactionError, TransactionResult};
pub use manager::{TransactionManager, XaResource};
pub use notification::{
    NotificationDispatcher, NullNotificationDispatcher, TransactionAction,
    TransactionNotification,
};
pub use resources::{BoundResource, ResourceBindings, ResourceFactoryHolder};
pub use transaction::{
    LocalTransaction, Transaction, TransactionStatus, DEFAULT_TIMEOUT_MILLIS,
};
pub use xa::XaTransaction;
