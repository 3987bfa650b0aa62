//! Transaction capability trait and the local (single-resource) variant.
//!
//! A transaction moves through
//! `NoTransaction -> Active -> {Committed, RolledBack}`, with
//! `Active -> MarkedRollback -> RollingBack -> RolledBack` as the
//! alternate path. The rollback-only question is answered from the status
//! on every call, never cached, because an underlying manager can move the
//! status asynchronously.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ulid::Ulid;

use crate::error::{TransactionError, TransactionResult};
use crate::notification::{
    NotificationDispatcher, TransactionAction, TransactionNotification,
};

/// Default transaction timeout, in milliseconds.
pub const DEFAULT_TIMEOUT_MILLIS: u64 = 30_000;

/// Status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// No transaction has begun yet.
    NoTransaction,
    /// The transaction is live and accepting work.
    Active,
    /// The transaction committed.
    Committed,
    /// The transaction can only be rolled back.
    MarkedRollback,
    /// The transaction rolled back.
    RolledBack,
    /// Rollback is in progress.
    RollingBack,
}

impl TransactionStatus {
    /// Whether the only valid resolution from this status is rollback.
    pub fn is_rollback_only(self) -> bool {
        matches!(
            self,
            TransactionStatus::MarkedRollback
                | TransactionStatus::RolledBack
                | TransactionStatus::RollingBack
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStatus::NoTransaction => "no transaction",
            TransactionStatus::Active => "active",
            TransactionStatus::Committed => "committed",
            TransactionStatus::MarkedRollback => "marked rollback",
            TransactionStatus::RolledBack => "rolled back",
            TransactionStatus::RollingBack => "rolling back",
        };
        write!(f, "{name}")
    }
}

/// Capability set shared by every transaction variant.
///
/// A transaction is logically owned by exactly one thread at a time:
/// whichever thread has it bound or holds it on its suspend stack. The
/// coordinator compares transactions by object identity (`Arc::ptr_eq`),
/// so implementations need no identity beyond the allocation itself.
pub trait Transaction: Send + Sync {
    /// Stable id used for logging and notifications.
    fn id(&self) -> &str;

    /// Name of the application this transaction belongs to.
    fn application_name(&self) -> &str;

    /// Start the transaction.
    fn begin(&self) -> TransactionResult<()>;

    /// Commit the transaction.
    fn commit(&self) -> TransactionResult<()>;

    /// Roll the transaction back.
    fn rollback(&self) -> TransactionResult<()>;

    /// Detach the transaction from the current thread without ending it.
    fn suspend(&self) -> TransactionResult<()>;

    /// Reattach the transaction after a matching [`suspend`](Self::suspend).
    ///
    /// Resuming a transaction that was never suspended, or was already
    /// resumed, fails with
    /// [`IllegalState`](crate::error::TransactionError::IllegalState).
    fn resume(&self) -> TransactionResult<()>;

    /// Current status, fetched fresh on every call.
    fn status(&self) -> TransactionResult<TransactionStatus>;

    /// Whether the only valid resolution is rollback. Derived from
    /// [`status`](Self::status), never cached.
    fn is_rollback_only(&self) -> TransactionResult<bool> {
        Ok(self.status()?.is_rollback_only())
    }

    /// Mark the transaction so the only possible outcome is rollback.
    fn set_rollback_only(&self) -> TransactionResult<()>;

    /// Configured timeout, in milliseconds.
    fn timeout_millis(&self) -> u64;

    /// Set the timeout, in milliseconds. Takes effect on the next
    /// [`begin`](Self::begin).
    fn set_timeout_millis(&self, millis: u64);

    /// When this transaction object was created.
    fn started_at(&self) -> DateTime<Utc>;

    /// Variant tag: `true` for XA transactions only.
    fn is_xa(&self) -> bool {
        false
    }
}

struct LocalState {
    status: TransactionStatus,
    suspended: bool,
}

/// A transaction over a single local resource.
///
/// Owns its status directly; `set_rollback_only` writes the status rather
/// than delegating anywhere.
pub struct LocalTransaction {
    id: String,
    application_name: String,
    dispatcher: Arc<dyn NotificationDispatcher>,
    started_at: DateTime<Utc>,
    timeout_millis: AtomicU64,
    state: Mutex<LocalState>,
}

impl LocalTransaction {
    /// Create a transaction that has not yet begun.
    pub fn new(
        application_name: impl Into<String>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            id: Ulid::new().to_string().to_lowercase(),
            application_name: application_name.into(),
            dispatcher,
            started_at: Utc::now(),
            timeout_millis: AtomicU64::new(DEFAULT_TIMEOUT_MILLIS),
            state: Mutex::new(LocalState {
                status: TransactionStatus::NoTransaction,
                suspended: false,
            }),
        }
    }

    fn notify(&self, action: TransactionAction) {
        self.dispatcher.dispatch(TransactionNotification::new(
            self.id.clone(),
            self.application_name.clone(),
            action,
        ));
    }
}

impl Transaction for LocalTransaction {
    fn id(&self) -> &str {
        &self.id
    }

    fn application_name(&self) -> &str {
        &self.application_name
    }

    fn begin(&self) -> TransactionResult<()> {
        {
            let mut state = self.state.lock();
            if state.status != TransactionStatus::NoTransaction {
                return Err(TransactionError::illegal_state(
                    "transaction has already begun",
                ));
            }
            state.status = TransactionStatus::Active;
        }
        self.notify(TransactionAction::Begin);
        Ok(())
    }

    fn commit(&self) -> TransactionResult<()> {
        {
            let mut state = self.state.lock();
            if state.status.is_rollback_only() {
                return Err(TransactionError::illegal_state(
                    "transaction is marked rollback-only and cannot commit",
                ));
            }
            if state.status != TransactionStatus::Active {
                return Err(TransactionError::illegal_state(format!(
                    "cannot commit a transaction that is {}",
                    state.status
                )));
            }
            state.status = TransactionStatus::Committed;
        }
        self.notify(TransactionAction::Commit);
        Ok(())
    }

    fn rollback(&self) -> TransactionResult<()> {
        {
            let mut state = self.state.lock();
            match state.status {
                TransactionStatus::Active | TransactionStatus::MarkedRollback => {
                    state.status = TransactionStatus::RolledBack;
                }
                status => {
                    return Err(TransactionError::illegal_state(format!(
                        "cannot roll back a transaction that is {status}"
                    )));
                }
            }
        }
        self.notify(TransactionAction::Rollback);
        Ok(())
    }

    fn suspend(&self) -> TransactionResult<()> {
        let mut state = self.state.lock();
        if state.status != TransactionStatus::Active {
            return Err(TransactionError::illegal_state(format!(
                "cannot suspend a transaction that is {}",
                state.status
            )));
        }
        if state.suspended {
            return Err(TransactionError::illegal_state(
                "transaction is already suspended",
            ));
        }
        state.suspended = true;
        Ok(())
    }

    fn resume(&self) -> TransactionResult<()> {
        let mut state = self.state.lock();
        if !state.suspended {
            return Err(TransactionError::illegal_state(
                "cannot resume a transaction with no matching suspend",
            ));
        }
        state.suspended = false;
        Ok(())
    }

    fn status(&self) -> TransactionResult<TransactionStatus> {
        Ok(self.state.lock().status)
    }

    fn set_rollback_only(&self) -> TransactionResult<()> {
        self.state.lock().status = TransactionStatus::MarkedRollback;
        Ok(())
    }

    fn timeout_millis(&self) -> u64 {
        self.timeout_millis.load(Ordering::Relaxed)
    }

    fn set_timeout_millis(&self, millis: u64) {
        self.timeout_millis.store(millis, Ordering::Relaxed);
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}
