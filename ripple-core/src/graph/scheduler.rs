//! Update Scheduler
//!
//! The scheduler is the update/transaction context of a runtime. It records
//! which sources hold uncommitted drafts, which listeners are waiting to run
//! and which derived nodes must be checked for disposal once the current
//! write or transaction settles.
//!
//! # Settlement
//!
//! Settlement always happens in the same order:
//!
//! 1. Commit every pending source (draft becomes durable).
//! 2. Sweep the deferred disposal set.
//! 3. Drain the pending listeners to exhaustion.
//!
//! An un-batched write settles as soon as its invalidation walk is done; a
//! batch settles once, when the outermost `batch` call returns.
//!
//! Pending sets are ordered by insertion and deduplicated by node ID, so a
//! listener scheduled twice in one settlement still runs once, in the
//! position of its first scheduling.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use super::node::{AnyDerived, ListenerNode, NodeId, SourceRef};

/// Transaction status of a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchStatus {
    /// No write is in progress.
    #[default]
    Inactive,

    /// A single un-batched write is propagating.
    Active,

    /// An explicit `batch` scope is open.
    Batched,
}

/// Pending work deferred until settlement.
#[derive(Default)]
pub(crate) struct UpdateScheduler {
    status: Cell<BatchStatus>,
    commits: RefCell<IndexMap<NodeId, SourceRef>>,
    effects: RefCell<IndexMap<NodeId, Weak<ListenerNode>>>,
    disposals: RefCell<IndexMap<NodeId, Weak<dyn AnyDerived>>>,

    /// Nesting depth of effect flushes.
    flush_depth: Cell<usize>,

    /// Notifications delivered since the outermost flush began.
    notified: Cell<usize>,
}

impl UpdateScheduler {
    pub(crate) fn status(&self) -> BatchStatus {
        self.status.get()
    }

    pub(crate) fn set_status(&self, status: BatchStatus) {
        self.status.set(status);
    }

    /// Whether writes are currently being collected for a later settlement.
    pub(crate) fn in_transaction(&self) -> bool {
        self.status.get() != BatchStatus::Inactive
    }

    /// Open a single-write transaction if none is open.
    ///
    /// Returns `true` when the caller is responsible for settling it.
    pub(crate) fn begin_write(&self) -> bool {
        if self.status.get() == BatchStatus::Inactive {
            self.status.set(BatchStatus::Active);
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Commits
    // ------------------------------------------------------------------

    pub(crate) fn stage_commit(&self, source: SourceRef) {
        self.commits.borrow_mut().entry(source.id()).or_insert(source);
    }

    pub(crate) fn unstage_commit(&self, id: NodeId) {
        self.commits.borrow_mut().shift_remove(&id);
    }

    pub(crate) fn take_commits(&self) -> Vec<SourceRef> {
        std::mem::take(&mut *self.commits.borrow_mut())
            .into_values()
            .collect()
    }

    // ------------------------------------------------------------------
    // Disposals
    // ------------------------------------------------------------------

    pub(crate) fn defer_disposal(&self, node: &Rc<dyn AnyDerived>) {
        self.disposals
            .borrow_mut()
            .entry(node.target().id)
            .or_insert_with(|| Rc::downgrade(node));
    }

    pub(crate) fn take_disposals(&self) -> Vec<Rc<dyn AnyDerived>> {
        std::mem::take(&mut *self.disposals.borrow_mut())
            .into_values()
            .filter_map(|weak| weak.upgrade())
            .collect()
    }

    // ------------------------------------------------------------------
    // Effects
    // ------------------------------------------------------------------

    pub(crate) fn schedule_effect(&self, listener: &Rc<ListenerNode>) {
        self.effects
            .borrow_mut()
            .entry(listener.id())
            .or_insert_with(|| Rc::downgrade(listener));
    }

    pub(crate) fn unschedule_effect(&self, id: NodeId) {
        self.effects.borrow_mut().shift_remove(&id);
    }

    /// Pop the oldest pending listener that is still alive.
    pub(crate) fn next_effect(&self) -> Option<Rc<ListenerNode>> {
        loop {
            let (_, weak) = self.effects.borrow_mut().shift_remove_index(0)?;
            if let Some(listener) = weak.upgrade() {
                return Some(listener);
            }
        }
    }

    /// Drop every pending listener, returning them.
    pub(crate) fn drain_effects(&self) -> Vec<Rc<ListenerNode>> {
        std::mem::take(&mut *self.effects.borrow_mut())
            .into_values()
            .filter_map(|weak| weak.upgrade())
            .collect()
    }

    pub(crate) fn pending_effects(&self) -> usize {
        self.effects.borrow().len()
    }

    /// Enter a flush, resetting the notification budget at the outermost one.
    pub(crate) fn begin_flush(&self) {
        if self.flush_depth.get() == 0 {
            self.notified.set(0);
        }
        self.flush_depth.set(self.flush_depth.get() + 1);
    }

    pub(crate) fn end_flush(&self) {
        self.flush_depth.set(self.flush_depth.get().saturating_sub(1));
    }

    /// Count one notification, returning the running total.
    pub(crate) fn count_notification(&self) -> usize {
        let total = self.notified.get() + 1;
        self.notified.set(total);
        total
    }
}
