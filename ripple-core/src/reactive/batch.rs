//! Transactions and settlement.
//!
//! A write, or a whole `batch` of writes, ends with a settlement:
//!
//! 1. Commit every pending draft.
//! 2. Re-check the derived nodes recorded for disposal.
//! 3. Run the pending listeners, oldest first, until none are left.
//!
//! Listeners may write cells while they run. Such a write settles on its own
//! before the listener returns, and any listener it schedules joins the same
//! pending set, so the outer flush picks it up in order.

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::runtime::Runtime;
use crate::error::Error;
use crate::graph::{BatchStatus, ListenerNode, SourceRef};

/// Balances `begin_flush` even if a listener panics.
struct FlushGuard<'a> {
    rt: &'a Runtime,
}

impl<'a> FlushGuard<'a> {
    fn enter(rt: &'a Runtime) -> Self {
        rt.scheduler().begin_flush();
        Self { rt }
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.rt.scheduler().end_flush();
    }
}

impl Runtime {
    /// Run `f` as one transaction and return its result.
    ///
    /// Writes made inside `f` stay drafts until the outermost `batch` returns;
    /// derived nodes read inside `f` see the drafts. Listeners run once, at the
    /// end, no matter how many of their sources were written.
    ///
    /// Nested calls join the enclosing transaction.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ripple_core::{Effect, Runtime, Signal};
    /// use std::cell::Cell;
    /// use std::rc::Rc;
    ///
    /// let rt = Runtime::new();
    /// let a = Signal::new(&rt, 1);
    /// let b = Signal::new(&rt, 2);
    /// let runs = Rc::new(Cell::new(0));
    ///
    /// let _effect = Effect::new(&rt, {
    ///     let (a, b, runs) = (a.clone(), b.clone(), runs.clone());
    ///     move || {
    ///         runs.set(runs.get() + 1);
    ///         let _ = a.get() + b.get();
    ///         Ok(())
    ///     }
    /// });
    ///
    /// rt.batch(|| {
    ///     a.set(10).unwrap();
    ///     b.set(20).unwrap();
    /// });
    /// assert_eq!(runs.get(), 2);
    /// ```
    ///
    /// # Panics
    ///
    /// A panic in `f` is re-raised once the transaction has settled: the
    /// drafts written before the panic are committed and listeners see them.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.scheduler().in_transaction() {
            return f();
        }

        self.scheduler().set_status(BatchStatus::Batched);
        debug!("transaction opened");

        let result = panic::catch_unwind(AssertUnwindSafe(f));

        self.scheduler().set_status(BatchStatus::Inactive);
        debug!("transaction closed");
        if result.is_err() {
            warn!("transaction body panicked, settling before unwinding");
        }
        self.settle();

        match result {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Commit, sweep and flush everything the closed write left pending.
    pub(crate) fn settle(&self) {
        let scheduler = self.scheduler();

        let commits = scheduler.take_commits();
        let committed = commits.len();
        for source in commits {
            source.commit();
        }

        for node in scheduler.take_disposals() {
            self.check_disposal(&node);
        }

        self.record(|stats| stats.settlements += 1);
        trace!(committed, effects = scheduler.pending_effects(), "settling");

        self.flush_effects();
    }

    fn flush_effects(&self) {
        let _flush = FlushGuard::enter(self);
        let scheduler = self.scheduler();
        let limit = self.config().effect_limit;

        while let Some(listener) = scheduler.next_effect() {
            if !self.needs_notify(&listener) {
                continue;
            }

            if let Some(limit) = limit {
                if scheduler.count_notification() > limit {
                    listener.target.clear_votes();
                    let dropped = scheduler.drain_effects();
                    for pending in &dropped {
                        pending.target.clear_votes();
                    }
                    warn!(limit, dropped = dropped.len() + 1, "effect limit reached");
                    self.report_fault(&Error::RunawayFlush { limit });
                    return;
                }
            }

            listener.target.clear_votes();
            self.notify_listener(&listener);
        }
    }

    /// Decide whether a pending listener really has a changed input.
    ///
    /// Derived sources are brought up to date first; each one that turns out
    /// unchanged retracts its votes, and once none are left the listener is
    /// skipped.
    fn needs_notify(&self, listener: &Rc<ListenerNode>) -> bool {
        let core = &listener.target;
        if listener.is_disposed() || !core.is_invalidated() {
            return false;
        }

        let sources: SmallVec<[SourceRef; 4]> = core.sources.borrow().clone();
        for source in sources {
            if let SourceRef::Derived(derived) = source {
                if self.recompute(&derived).is_err() {
                    break;
                }
                if !core.is_invalidated() {
                    return false;
                }
            }
        }
        core.is_invalidated()
    }

    /// Deliver one notification to `listener`.
    pub(crate) fn notify_listener(&self, listener: &Rc<ListenerNode>) {
        self.record(|stats| stats.notifications += 1);
        self.run_listener(listener);
    }

    /// Run a listener's callback now.
    ///
    /// A fault is passed to the fault handler and the listener is disposed.
    /// Disposed listeners are ignored.
    pub fn run_listener(&self, listener: &Rc<ListenerNode>) {
        if listener.is_disposed() {
            return;
        }
        if let Err(err) = listener.notify() {
            self.report_fault(&err);
            self.dispose(listener);
        }
    }
}
