//! Transaction lifecycle notifications.
//!
//! Each transaction variant decides when to notify; the coordinator never
//! dispatches anything itself. Failures inside a dispatcher are the
//! dispatcher's problem, which is why [`NotificationDispatcher::dispatch`]
//! is infallible from this crate's point of view.

use std::fmt;

use chrono::{DateTime, Utc};

/// Lifecycle transition a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionAction {
    /// The transaction began.
    Begin,
    /// The transaction committed.
    Commit,
    /// The transaction rolled back.
    Rollback,
}

impl fmt::Display for TransactionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionAction::Begin => write!(f, "begin"),
            TransactionAction::Commit => write!(f, "commit"),
            TransactionAction::Rollback => write!(f, "rollback"),
        }
    }
}

/// Payload handed to a [`NotificationDispatcher`] on each lifecycle
/// transition.
#[derive(Debug, Clone)]
pub struct TransactionNotification {
    /// Id of the transaction that transitioned.
    pub transaction_id: String,
    /// Name of the application the transaction belongs to.
    pub application_name: String,
    /// Which transition happened.
    pub action: TransactionAction,
    /// When the transition was observed.
    pub timestamp: DateTime<Utc>,
}

impl TransactionNotification {
    /// Build a notification stamped with the current time.
    pub fn new(
        transaction_id: impl Into<String>,
        application_name: impl Into<String>,
        action: TransactionAction,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            application_name: application_name.into(),
            action,
            timestamp: Utc::now(),
        }
    }
}

/// Observer for transaction lifecycle transitions.
pub trait NotificationDispatcher: Send + Sync {
    /// Deliver a notification to whoever is listening.
    fn dispatch(&self, notification: TransactionNotification);
}

/// Dispatcher that drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotificationDispatcher;

impl NotificationDispatcher for NullNotificationDispatcher {
    fn dispatch(&self, _notification: TransactionNotification) {}
}
