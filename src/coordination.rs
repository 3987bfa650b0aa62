//! Thread-bound transaction coordination.
//!
//! The coordinator holds, for each thread, one optional active transaction
//! and a LIFO stack of suspended transactions. Every operation mutates only
//! the calling thread's entry, so correctness rests on thread confinement:
//! a transaction is owned by whichever thread has it bound or suspended,
//! and the outer mutex only protects the shape of the map. Entries are
//! created lazily on first use and pruned as soon as a thread has neither
//! an active nor a suspended transaction.
//!
//! Suspend/resume pairs nest in strict LIFO order: work A suspends its
//! transaction, work B binds and suspends its own, and resumes restore A's
//! transaction only after B's has been resumed and unbound. Violating the
//! order is a caller bug surfaced as
//! [`IllegalState`](crate::error::TransactionError::IllegalState), never
//! silently tolerated.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{TransactionError, TransactionResult};
use crate::transaction::Transaction;

/// Coordinates at most one active transaction per thread.
///
/// Cheap to clone: clones share the same underlying state. Construct one
/// explicitly and pass it to whatever drives units of work; it lives for
/// the process's lifetime and has no teardown.
#[derive(Clone, Default)]
pub struct TransactionCoordinator {
    inner: Arc<CoordinatorInner>,
}

#[derive(Default)]
struct CoordinatorInner {
    threads: Mutex<HashMap<ThreadId, ThreadSlot>>,
}

#[derive(Default)]
struct ThreadSlot {
    active: Option<Arc<dyn Transaction>>,
    suspended: Vec<Arc<dyn Transaction>>,
}

impl ThreadSlot {
    fn is_empty(&self) -> bool {
        self.active.is_none() && self.suspended.is_empty()
    }
}

impl TransactionCoordinator {
    /// Create a coordinator with no transactions bound anywhere.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the calling thread's slot, creating the entry
    /// lazily and pruning it if the call leaves it empty.
    fn with_slot<T>(&self, f: impl FnOnce(&mut ThreadSlot) -> T) -> T {
        let mut threads = self.inner.threads.lock();
        let id = thread::current().id();
        let out = f(threads.entry(id).or_default());
        if matches!(threads.get(&id), Some(slot) if slot.is_empty()) {
            threads.remove(&id);
        }
        out
    }

    /// Bind `tx` as the calling thread's active transaction.
    ///
    /// Fails with [`IllegalState`](TransactionError::IllegalState) if the
    /// thread already has an active transaction. The suspend stack is not
    /// consulted.
    pub fn bind_transaction(&self, tx: Arc<dyn Transaction>) -> TransactionResult<()> {
        self.with_slot(|slot| {
            if slot.active.is_some() {
                return Err(TransactionError::illegal_state(
                    "a transaction is already bound to this thread",
                ));
            }
            debug!(tx_id = tx.id(), "bind transaction");
            slot.active = Some(tx);
            Ok(())
        })
    }

    /// Clear the calling thread's active slot if it holds exactly `tx`.
    ///
    /// A no-op in every other case, including when nothing is bound at
    /// all; this never errors.
    pub fn unbind_transaction(&self, tx: &Arc<dyn Transaction>) {
        self.with_slot(|slot| {
            if let Some(active) = &slot.active {
                if Arc::ptr_eq(active, tx) {
                    debug!(tx_id = tx.id(), "unbind transaction");
                    slot.active = None;
                }
            }
        });
    }

    /// The calling thread's active transaction, if any.
    pub fn current_transaction(&self) -> Option<Arc<dyn Transaction>> {
        let threads = self.inner.threads.lock();
        threads
            .get(&thread::current().id())
            .and_then(|slot| slot.active.clone())
    }

    /// Suspend the calling thread's active transaction and push it onto
    /// the thread's suspend stack.
    ///
    /// Fails with [`IllegalState`](TransactionError::IllegalState) if
    /// nothing is active. The slot is only cleared once the transaction's
    /// own `suspend()` succeeded.
    pub fn suspend_current_transaction(&self) -> TransactionResult<()> {
        let tx = self.current_transaction().ok_or_else(|| {
            TransactionError::illegal_state("no active transaction to suspend")
        })?;
        tx.suspend()?;
        debug!(tx_id = tx.id(), "suspend transaction");
        self.with_slot(|slot| {
            slot.active = None;
            slot.suspended.push(tx);
        });
        Ok(())
    }

    /// Pop the most recently suspended transaction, resume it, and bind
    /// it as the calling thread's active transaction.
    ///
    /// Fails with [`IllegalState`](TransactionError::IllegalState) when
    /// the active slot is already occupied or the suspend stack is empty.
    pub fn resume_suspended_transaction(&self) -> TransactionResult<()> {
        let tx = self.with_slot(|slot| {
            if slot.active.is_some() {
                return Err(TransactionError::illegal_state(
                    "cannot resume while a transaction is bound to this thread",
                ));
            }
            match slot.suspended.pop() {
                Some(tx) => Ok(tx),
                None => Err(TransactionError::illegal_state(
                    "no suspended transaction to resume",
                )),
            }
        })?;
        tx.resume()?;
        debug!(tx_id = tx.id(), "resume transaction");
        self.with_slot(|slot| slot.active = Some(tx));
        Ok(())
    }

    /// Opportunistically reattach a previously suspended XA transaction.
    ///
    /// A no-op unless the calling thread's active slot is empty *and* the
    /// top of its suspend stack is an XA transaction; in that case this
    /// behaves like [`resume_suspended_transaction`]. Used by
    /// resource-borrowing operations that must not disturb a non-XA
    /// active or suspended transaction.
    ///
    /// [`resume_suspended_transaction`]: Self::resume_suspended_transaction
    pub fn resume_xa_transaction_if_available(&self) -> TransactionResult<()> {
        let xa_on_top = {
            let threads = self.inner.threads.lock();
            threads.get(&thread::current().id()).is_some_and(|slot| {
                slot.active.is_none()
                    && slot.suspended.last().is_some_and(|tx| tx.is_xa())
            })
        };
        if xa_on_top {
            self.resume_suspended_transaction()
        } else {
            Ok(())
        }
    }

    /// Resolve the calling thread's active transaction: roll back if it is
    /// rollback-only, commit otherwise. No-op when nothing is active.
    ///
    /// The slot is cleared before the protocol call, so a commit or
    /// rollback failure can never leave a stale active reference. Inner
    /// failures propagate; resolution is an explicit decision point, not
    /// cleanup.
    pub fn resolve_transaction(&self) -> TransactionResult<()> {
        let tx = match self.current_transaction() {
            Some(tx) => tx,
            None => return Ok(()),
        };
        let rollback = tx.is_rollback_only()?;
        self.unbind_transaction(&tx);
        if rollback {
            debug!(tx_id = tx.id(), "resolving transaction with rollback");
            tx.rollback()
        } else {
            debug!(tx_id = tx.id(), "resolving transaction with commit");
            tx.commit()
        }
    }

    /// Best-effort commit of the calling thread's active transaction.
    ///
    /// No-op when nothing is active. Unbinds first, then commits; a
    /// failure from the underlying call is logged and suppressed, so this
    /// is safe to invoke from outer exception handlers that must never
    /// themselves fail.
    pub fn commit_current_transaction(&self) {
        let tx = match self.current_transaction() {
            Some(tx) => tx,
            None => return,
        };
        self.unbind_transaction(&tx);
        if let Err(e) = tx.commit() {
            error!(tx_id = tx.id(), error = %e, "commit failed during cleanup");
        }
    }

    /// Best-effort rollback of the calling thread's active transaction.
    ///
    /// Same guarantees as [`commit_current_transaction`](Self::commit_current_transaction).
    pub fn rollback_current_transaction(&self) {
        let tx = match self.current_transaction() {
            Some(tx) => tx,
            None => return,
        };
        self.unbind_transaction(&tx);
        if let Err(e) = tx.rollback() {
            error!(tx_id = tx.id(), error = %e, "rollback failed during cleanup");
        }
    }

    /// Depth of the calling thread's suspend stack.
    pub fn suspended_count(&self) -> usize {
        let threads = self.inner.threads.lock();
        threads
            .get(&thread::current().id())
            .map_or(0, |slot| slot.suspended.len())
    }

    /// Number of threads currently holding an active or suspended
    /// transaction.
    pub fn tracked_threads(&self) -> usize {
        self.inner.threads.lock().len()
    }
}

impl fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("tracked_threads", &self.tracked_threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{DateTime, Utc};

    use crate::error::TransactionError;
    use crate::transaction::{TransactionStatus, DEFAULT_TIMEOUT_MILLIS};

    #[derive(Default)]
    struct MockTransaction {
        xa: bool,
        rollback_only: bool,
        fail_commit: bool,
        fail_rollback: bool,
        begins: AtomicUsize,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
        suspends: AtomicUsize,
        resumes: AtomicUsize,
    }

    impl MockTransaction {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn xa() -> Arc<Self> {
            Arc::new(Self {
                xa: true,
                ..Self::default()
            })
        }

        fn rollback_only() -> Arc<Self> {
            Arc::new(Self {
                rollback_only: true,
                ..Self::default()
            })
        }

        fn failing_commit() -> Arc<Self> {
            Arc::new(Self {
                fail_commit: true,
                ..Self::default()
            })
        }

        fn failing_rollback() -> Arc<Self> {
            Arc::new(Self {
                fail_rollback: true,
                ..Self::default()
            })
        }

        fn count(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    impl Transaction for MockTransaction {
        fn id(&self) -> &str {
            "mock"
        }

        fn application_name(&self) -> &str {
            "test-app"
        }

        fn begin(&self) -> TransactionResult<()> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn commit(&self) -> TransactionResult<()> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            if self.fail_commit {
                Err(TransactionError::failure("commit", "commit refused".into()))
            } else {
                Ok(())
            }
        }

        fn rollback(&self) -> TransactionResult<()> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            if self.fail_rollback {
                Err(TransactionError::failure(
                    "rollback",
                    "rollback refused".into(),
                ))
            } else {
                Ok(())
            }
        }

        fn suspend(&self) -> TransactionResult<()> {
            self.suspends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn resume(&self) -> TransactionResult<()> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn status(&self) -> TransactionResult<TransactionStatus> {
            Ok(if self.rollback_only {
                TransactionStatus::MarkedRollback
            } else {
                TransactionStatus::Active
            })
        }

        fn set_rollback_only(&self) -> TransactionResult<()> {
            Ok(())
        }

        fn timeout_millis(&self) -> u64 {
            DEFAULT_TIMEOUT_MILLIS
        }

        fn set_timeout_millis(&self, _millis: u64) {}

        fn started_at(&self) -> DateTime<Utc> {
            DateTime::<Utc>::MIN_UTC
        }

        fn is_xa(&self) -> bool {
            self.xa
        }
    }

    fn as_tx(mock: &Arc<MockTransaction>) -> Arc<dyn Transaction> {
        mock.clone()
    }

    #[test]
    fn test_bind_and_unbind() {
        let tc = TransactionCoordinator::new();
        assert!(tc.current_transaction().is_none());

        let tx = as_tx(&MockTransaction::new());
        tc.bind_transaction(tx.clone()).unwrap();
        assert!(Arc::ptr_eq(&tc.current_transaction().unwrap(), &tx));

        tc.unbind_transaction(&tx);
        assert!(tc.current_transaction().is_none());
    }

    #[test]
    fn test_bind_over_already_bound_fails() {
        let tc = TransactionCoordinator::new();
        let tx = as_tx(&MockTransaction::new());
        tc.bind_transaction(tx.clone()).unwrap();

        let err = tc
            .bind_transaction(as_tx(&MockTransaction::new()))
            .unwrap_err();
        assert!(err.is_illegal_state());

        // the original binding is untouched
        assert!(Arc::ptr_eq(&tc.current_transaction().unwrap(), &tx));
    }

    #[test]
    fn test_unbind_without_bound_is_noop() {
        let tc = TransactionCoordinator::new();
        tc.unbind_transaction(&as_tx(&MockTransaction::new()));
        assert!(tc.current_transaction().is_none());
    }

    #[test]
    fn test_unbind_of_other_transaction_is_noop() {
        let tc = TransactionCoordinator::new();
        let tx = as_tx(&MockTransaction::new());
        tc.bind_transaction(tx.clone()).unwrap();

        tc.unbind_transaction(&as_tx(&MockTransaction::new()));
        assert!(Arc::ptr_eq(&tc.current_transaction().unwrap(), &tx));
        tc.unbind_transaction(&tx);
    }

    #[test]
    fn test_suspend_resume_roundtrip() {
        let tc = TransactionCoordinator::new();
        let mock = MockTransaction::new();
        let tx = as_tx(&mock);

        tc.bind_transaction(tx.clone()).unwrap();
        tc.suspend_current_transaction().unwrap();
        assert!(tc.current_transaction().is_none());
        assert_eq!(tc.suspended_count(), 1);

        tc.resume_suspended_transaction().unwrap();
        assert!(Arc::ptr_eq(&tc.current_transaction().unwrap(), &tx));
        assert_eq!(tc.suspended_count(), 0);
        assert_eq!(MockTransaction::count(&mock.suspends), 1);
        assert_eq!(MockTransaction::count(&mock.resumes), 1);
    }

    #[test]
    fn test_suspend_without_active_fails() {
        let tc = TransactionCoordinator::new();
        assert!(tc
            .suspend_current_transaction()
            .unwrap_err()
            .is_illegal_state());
    }

    #[test]
    fn test_resume_with_empty_stack_fails() {
        let tc = TransactionCoordinator::new();
        assert!(tc
            .resume_suspended_transaction()
            .unwrap_err()
            .is_illegal_state());
    }

    #[test]
    fn test_resume_with_active_transaction_fails() {
        let tc = TransactionCoordinator::new();
        let mock = MockTransaction::xa();
        tc.bind_transaction(as_tx(&mock)).unwrap();

        assert!(tc
            .resume_suspended_transaction()
            .unwrap_err()
            .is_illegal_state());
        assert_eq!(MockTransaction::count(&mock.resumes), 0);
    }

    #[test]
    fn test_nested_suspensions_unwind_in_lifo_order() {
        let tc = TransactionCoordinator::new();
        let mock1 = MockTransaction::new();
        let mock2 = MockTransaction::new();
        let tx1 = as_tx(&mock1);
        let tx2 = as_tx(&mock2);

        tc.bind_transaction(tx1.clone()).unwrap();
        tc.suspend_current_transaction().unwrap();
        assert!(tc.current_transaction().is_none());

        tc.bind_transaction(tx2.clone()).unwrap();
        tc.suspend_current_transaction().unwrap();
        assert!(tc.current_transaction().is_none());
        assert_eq!(tc.suspended_count(), 2);

        tc.resume_suspended_transaction().unwrap();
        assert!(Arc::ptr_eq(&tc.current_transaction().unwrap(), &tx2));
        tc.unbind_transaction(&tx2);
        assert!(tc.current_transaction().is_none());

        tc.resume_suspended_transaction().unwrap();
        assert!(Arc::ptr_eq(&tc.current_transaction().unwrap(), &tx1));

        assert_eq!(MockTransaction::count(&mock1.suspends), 1);
        assert_eq!(MockTransaction::count(&mock1.resumes), 1);
        assert_eq!(MockTransaction::count(&mock2.suspends), 1);
        assert_eq!(MockTransaction::count(&mock2.resumes), 1);
    }

    #[test]
    fn test_resume_xa_if_available_with_nothing_suspended() {
        let tc = TransactionCoordinator::new();
        tc.resume_xa_transaction_if_available().unwrap();

        let mock = MockTransaction::new();
        tc.bind_transaction(as_tx(&mock)).unwrap();
        tc.resume_xa_transaction_if_available().unwrap();
        assert_eq!(MockTransaction::count(&mock.resumes), 0);
    }

    #[test]
    fn test_resume_xa_if_available_ignores_non_xa_suspended() {
        let tc = TransactionCoordinator::new();
        let mock = MockTransaction::new();
        tc.bind_transaction(as_tx(&mock)).unwrap();
        tc.suspend_current_transaction().unwrap();

        tc.resume_xa_transaction_if_available().unwrap();
        assert!(tc.current_transaction().is_none());
        assert_eq!(tc.suspended_count(), 1);
        assert_eq!(MockTransaction::count(&mock.resumes), 0);
    }

    #[test]
    fn test_resume_xa_if_available_restores_suspended_xa() {
        let tc = TransactionCoordinator::new();
        let mock = MockTransaction::xa();
        let tx = as_tx(&mock);
        tc.bind_transaction(tx.clone()).unwrap();
        tc.suspend_current_transaction().unwrap();

        tc.resume_xa_transaction_if_available().unwrap();
        assert!(Arc::ptr_eq(&tc.current_transaction().unwrap(), &tx));
        assert_eq!(MockTransaction::count(&mock.suspends), 1);
        assert_eq!(MockTransaction::count(&mock.resumes), 1);
    }

    #[test]
    fn test_resolve_commits_when_not_rollback_only() {
        let tc = TransactionCoordinator::new();
        let mock = MockTransaction::xa();
        tc.bind_transaction(as_tx(&mock)).unwrap();

        tc.resolve_transaction().unwrap();
        assert!(tc.current_transaction().is_none());
        assert_eq!(MockTransaction::count(&mock.commits), 1);
        assert_eq!(MockTransaction::count(&mock.rollbacks), 0);
    }

    #[test]
    fn test_resolve_rolls_back_when_rollback_only() {
        let tc = TransactionCoordinator::new();
        let mock = MockTransaction::rollback_only();
        tc.bind_transaction(as_tx(&mock)).unwrap();

        tc.resolve_transaction().unwrap();
        assert!(tc.current_transaction().is_none());
        assert_eq!(MockTransaction::count(&mock.rollbacks), 1);
        assert_eq!(MockTransaction::count(&mock.commits), 0);
    }

    #[test]
    fn test_resolve_clears_slot_even_when_commit_fails() {
        let tc = TransactionCoordinator::new();
        let mock = MockTransaction::failing_commit();
        tc.bind_transaction(as_tx(&mock)).unwrap();

        assert!(tc.resolve_transaction().is_err());
        assert!(tc.current_transaction().is_none());
    }

    #[test]
    fn test_resolve_without_transaction_is_noop() {
        let tc = TransactionCoordinator::new();
        tc.resolve_transaction().unwrap();
    }

    #[test]
    fn test_commit_current_transaction() {
        let tc = TransactionCoordinator::new();
        tc.commit_current_transaction();

        let mock = MockTransaction::new();
        tc.bind_transaction(as_tx(&mock)).unwrap();
        tc.commit_current_transaction();

        assert!(tc.current_transaction().is_none());
        assert_eq!(MockTransaction::count(&mock.commits), 1);
    }

    #[test]
    fn test_commit_current_does_not_fail_on_exception() {
        let tc = TransactionCoordinator::new();
        let mock = MockTransaction::failing_commit();
        tc.bind_transaction(as_tx(&mock)).unwrap();

        // must return normally with the slot cleared
        tc.commit_current_transaction();
        assert!(tc.current_transaction().is_none());
        assert_eq!(MockTransaction::count(&mock.commits), 1);
    }

    #[test]
    fn test_rollback_current_transaction() {
        let tc = TransactionCoordinator::new();
        tc.rollback_current_transaction();

        let mock = MockTransaction::new();
        tc.bind_transaction(as_tx(&mock)).unwrap();
        tc.rollback_current_transaction();

        assert!(tc.current_transaction().is_none());
        assert_eq!(MockTransaction::count(&mock.rollbacks), 1);
    }

    #[test]
    fn test_rollback_current_does_not_fail_on_exception() {
        let tc = TransactionCoordinator::new();
        let mock = MockTransaction::failing_rollback();
        tc.bind_transaction(as_tx(&mock)).unwrap();

        tc.rollback_current_transaction();
        assert!(tc.current_transaction().is_none());
        assert_eq!(MockTransaction::count(&mock.rollbacks), 1);
    }

    #[test]
    fn test_commit_current_with_suspended_transaction() {
        let tc = TransactionCoordinator::new();
        let xa_mock = MockTransaction::xa();
        let xa_tx = as_tx(&xa_mock);
        let inner = MockTransaction::new();

        tc.bind_transaction(xa_tx.clone()).unwrap();
        tc.suspend_current_transaction().unwrap();
        tc.bind_transaction(as_tx(&inner)).unwrap();
        tc.commit_current_transaction();
        tc.resume_suspended_transaction().unwrap();

        assert!(Arc::ptr_eq(&tc.current_transaction().unwrap(), &xa_tx));
        assert_eq!(MockTransaction::count(&xa_mock.suspends), 1);
        assert_eq!(MockTransaction::count(&xa_mock.resumes), 1);
        assert_eq!(MockTransaction::count(&inner.commits), 1);
    }

    #[test]
    fn test_rollback_current_with_suspended_transaction() {
        let tc = TransactionCoordinator::new();
        let xa_mock = MockTransaction::xa();
        let xa_tx = as_tx(&xa_mock);
        let inner = MockTransaction::new();

        tc.bind_transaction(xa_tx.clone()).unwrap();
        tc.suspend_current_transaction().unwrap();
        tc.bind_transaction(as_tx(&inner)).unwrap();
        tc.rollback_current_transaction();
        tc.resume_suspended_transaction().unwrap();

        assert!(Arc::ptr_eq(&tc.current_transaction().unwrap(), &xa_tx));
        assert_eq!(MockTransaction::count(&xa_mock.suspends), 1);
        assert_eq!(MockTransaction::count(&xa_mock.resumes), 1);
        assert_eq!(MockTransaction::count(&inner.rollbacks), 1);
        assert_eq!(MockTransaction::count(&inner.commits), 0);
    }

    #[test]
    fn test_thread_entries_are_pruned_when_idle() {
        let tc = TransactionCoordinator::new();
        assert_eq!(tc.tracked_threads(), 0);

        let tx = as_tx(&MockTransaction::new());
        tc.bind_transaction(tx.clone()).unwrap();
        assert_eq!(tc.tracked_threads(), 1);

        tc.suspend_current_transaction().unwrap();
        assert_eq!(tc.tracked_threads(), 1);

        tc.resume_suspended_transaction().unwrap();
        tc.unbind_transaction(&tx);
        assert_eq!(tc.tracked_threads(), 0);
    }

    #[test]
    fn test_threads_do_not_share_slots() {
        let tc = TransactionCoordinator::new();
        let tx = as_tx(&MockTransaction::new());
        tc.bind_transaction(tx.clone()).unwrap();

        let other = tc.clone();
        thread::spawn(move || {
            assert!(other.current_transaction().is_none());
            let tx = as_tx(&MockTransaction::new());
            other.bind_transaction(tx.clone()).unwrap();
            other.unbind_transaction(&tx);
        })
        .join()
        .unwrap();

        assert!(Arc::ptr_eq(&tc.current_transaction().unwrap(), &tx));
        tc.unbind_transaction(&tx);
        assert_eq!(tc.tracked_threads(), 0);
    }
}
