//! XA transaction variant.
//!
//! An [`XaTransaction`] delegates the protocol calls to an external
//! [`TransactionManager`] and additionally owns a resource binding table
//! plus the double-resume guard. Timeouts are configured in milliseconds
//! and pushed to collaborators in whole seconds (truncating division).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ulid::Ulid;

use crate::error::{TransactionError, TransactionResult};
use crate::manager::{TransactionManager, XaResource};
use crate::notification::{
    NotificationDispatcher, TransactionAction, TransactionNotification,
};
use crate::resources::{BoundResource, ResourceBindings, ResourceFactoryHolder};
use crate::transaction::{Transaction, TransactionStatus, DEFAULT_TIMEOUT_MILLIS};

struct XaState {
    begun: bool,
    suspended: bool,
    bindings: ResourceBindings,
}

/// A transaction that may enlist multiple resource managers under a shared
/// commit/rollback decision.
///
/// Status lives in the external manager, so `status()` and
/// `is_rollback_only()` re-query it on every call.
pub struct XaTransaction {
    id: String,
    application_name: String,
    manager: Arc<dyn TransactionManager>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    started_at: DateTime<Utc>,
    timeout_millis: AtomicU64,
    state: Mutex<XaState>,
}

impl XaTransaction {
    /// Create an XA transaction that has not yet begun.
    pub fn new(
        application_name: impl Into<String>,
        manager: Arc<dyn TransactionManager>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            id: Ulid::new().to_string().to_lowercase(),
            application_name: application_name.into(),
            manager,
            dispatcher,
            started_at: Utc::now(),
            timeout_millis: AtomicU64::new(DEFAULT_TIMEOUT_MILLIS),
            state: Mutex::new(XaState {
                begun: false,
                suspended: false,
                bindings: ResourceBindings::new(),
            }),
        }
    }

    /// Enlist a resource manager in this transaction and push the
    /// configured timeout onto it.
    ///
    /// Only valid once the transaction has begun and while it is not
    /// suspended.
    pub fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> TransactionResult<()> {
        {
            let state = self.state.lock();
            if !state.begun {
                return Err(TransactionError::illegal_state(
                    "cannot enlist a resource before the transaction has begun",
                ));
            }
            if state.suspended {
                return Err(TransactionError::illegal_state(
                    "cannot enlist a resource on a suspended transaction",
                ));
            }
        }
        self.manager
            .enlist_resource(resource.clone())
            .map_err(|e| TransactionError::failure("enlist", e))?;
        resource
            .set_transaction_timeout(self.timeout_millis() / 1000)
            .map_err(|e| TransactionError::failure("set timeout", e))?;
        Ok(())
    }

    /// Bind a resource under the holder's factory identity.
    pub fn bind_resource(&self, holder: &dyn ResourceFactoryHolder, resource: BoundResource) {
        self.state.lock().bindings.bind(holder, resource);
    }

    /// Whether a resource is bound for the holder's factory.
    pub fn has_resource(&self, holder: &dyn ResourceFactoryHolder) -> bool {
        self.state.lock().bindings.has(holder)
    }

    /// The resource bound for the holder's factory, if any.
    pub fn get_resource(&self, holder: &dyn ResourceFactoryHolder) -> Option<BoundResource> {
        self.state.lock().bindings.get(holder)
    }

    fn notify(&self, action: TransactionAction) {
        self.dispatcher.dispatch(TransactionNotification::new(
            self.id.clone(),
            self.application_name.clone(),
            action,
        ));
    }
}

impl Transaction for XaTransaction {
    fn id(&self) -> &str {
        &self.id
    }

    fn application_name(&self) -> &str {
        &self.application_name
    }

    fn begin(&self) -> TransactionResult<()> {
        {
            let state = self.state.lock();
            if state.begun {
                return Err(TransactionError::illegal_state(
                    "transaction has already begun",
                ));
            }
        }
        // The manager must see the timeout before begin() starts the clock.
        self.manager
            .set_transaction_timeout(self.timeout_millis() / 1000)
            .map_err(|e| TransactionError::failure("set timeout", e))?;
        self.manager
            .begin()
            .map_err(|e| TransactionError::failure("begin", e))?;
        self.state.lock().begun = true;
        self.notify(TransactionAction::Begin);
        Ok(())
    }

    fn commit(&self) -> TransactionResult<()> {
        if self.is_rollback_only()? {
            return Err(TransactionError::illegal_state(
                "transaction is marked rollback-only and cannot commit",
            ));
        }
        self.manager
            .commit()
            .map_err(|e| TransactionError::failure("commit", e))?;
        self.notify(TransactionAction::Commit);
        Ok(())
    }

    fn rollback(&self) -> TransactionResult<()> {
        self.manager
            .rollback()
            .map_err(|e| TransactionError::failure("rollback", e))?;
        self.notify(TransactionAction::Rollback);
        Ok(())
    }

    fn suspend(&self) -> TransactionResult<()> {
        {
            let state = self.state.lock();
            if !state.begun {
                return Err(TransactionError::illegal_state(
                    "cannot suspend a transaction that has not begun",
                ));
            }
            if state.suspended {
                return Err(TransactionError::illegal_state(
                    "transaction is already suspended",
                ));
            }
        }
        self.manager
            .suspend()
            .map_err(|e| TransactionError::failure("suspend", e))?;
        self.state.lock().suspended = true;
        Ok(())
    }

    fn resume(&self) -> TransactionResult<()> {
        {
            let state = self.state.lock();
            if !state.suspended {
                return Err(TransactionError::illegal_state(
                    "cannot resume a transaction with no matching suspend",
                ));
            }
        }
        self.manager
            .resume()
            .map_err(|e| TransactionError::failure("resume", e))?;
        self.state.lock().suspended = false;
        Ok(())
    }

    fn status(&self) -> TransactionResult<TransactionStatus> {
        self.manager
            .status()
            .map_err(|e| TransactionError::failure("status", e))
    }

    fn set_rollback_only(&self) -> TransactionResult<()> {
        self.manager
            .set_rollback_only()
            .map_err(|e| TransactionError::failure("set rollback-only", e))
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

    fn is_xa(&self) -> bool {
        true
    }
}
