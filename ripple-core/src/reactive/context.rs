//! Reactive Context
//!
//! The reactive context tracks which computation is currently running.
//! This enables automatic dependency tracking: when a node is read,
//! we can register the current computation as a dependent.
//!
//! # Implementation
//!
//! There is a single active frame: the running target plus a cursor into its
//! source list. Entering a target saves the previous frame in a guard and
//! restores it on drop, so frames nest in stack discipline and a fault or a
//! panic in the middle of an evaluation never leaves the context corrupted.
//!
//! Each read compares the source against the slot under the cursor. A stable
//! dependency list therefore costs no subscription churn at all; only the
//! slots that actually changed are unsubscribed and resubscribed. When the
//! frame closes, slots past the cursor belong to reads that did not happen
//! this time and are released.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use smallvec::SmallVec;

use super::runtime::Runtime;
use crate::error::{Error, Misuse, Result};
use crate::graph::{AnyDerived, ListenerNode, SourceRef, TargetRef};

/// The active evaluation frame.
#[derive(Default)]
struct Frame {
    target: Option<TargetRef>,

    /// Position of the next read in the target's source list.
    index: usize,
}

/// Per-runtime execution state.
#[derive(Default)]
pub(crate) struct ExecutionContext {
    frame: RefCell<Frame>,

    /// Number of derived frames anywhere on the stack.
    derived_depth: Cell<usize>,

    /// Number of derived nodes currently re-deriving against committed state.
    rollback_depth: Cell<usize>,
}

impl ExecutionContext {
    pub(crate) fn current_target(&self) -> Option<TargetRef> {
        self.frame.borrow().target.clone()
    }

    /// Whether a derived computation is running anywhere on the stack.
    pub(crate) fn in_derived(&self) -> bool {
        self.derived_depth.get() > 0
    }

    /// Whether reads should observe committed rather than draft state.
    pub(crate) fn in_rollback(&self) -> bool {
        self.rollback_depth.get() > 0
    }
}

/// Restores the previous frame when an evaluation ends.
struct FrameGuard<'a> {
    rt: &'a Runtime,
    target: TargetRef,
    previous: Frame,
}

impl<'a> FrameGuard<'a> {
    fn enter(rt: &'a Runtime, target: TargetRef) -> Self {
        let context = rt.context();
        let previous = std::mem::replace(
            &mut *context.frame.borrow_mut(),
            Frame {
                target: Some(target.clone()),
                index: 0,
            },
        );

        target.core().running.set(true);
        if let TargetRef::Derived(_) = target {
            context.derived_depth.set(context.derived_depth.get() + 1);
        }

        Self {
            rt,
            target,
            previous,
        }
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let context = self.rt.context();
        let index = context.frame.borrow().index;
        let core = self.target.core();

        let stale: SmallVec<[SourceRef; 4]> = {
            let mut sources = core.sources.borrow_mut();
            if sources.len() > index {
                sources.drain(index..).collect()
            } else {
                SmallVec::new()
            }
        };

        *context.frame.borrow_mut() = std::mem::take(&mut self.previous);
        core.running.set(false);
        if let TargetRef::Derived(_) = self.target {
            context.derived_depth.set(context.derived_depth.get() - 1);
        }

        for source in stale {
            self.rt.unsubscribe(&source, core.id);
        }
    }
}

/// Marks a derived node as re-deriving against committed state.
pub(crate) struct RollbackGuard<'a> {
    rt: &'a Runtime,
    node: Rc<dyn AnyDerived>,
}

impl<'a> RollbackGuard<'a> {
    pub(crate) fn enter(rt: &'a Runtime, node: &Rc<dyn AnyDerived>) -> Self {
        let context = rt.context();
        node.rolling_back().set(true);
        context.rollback_depth.set(context.rollback_depth.get() + 1);
        Self {
            rt,
            node: node.clone(),
        }
    }
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        let context = self.rt.context();
        self.node.rolling_back().set(false);
        context.rollback_depth.set(context.rollback_depth.get() - 1);
    }
}

/// Suspends tracking for a listener while an `untracked` scope runs.
struct TrackingGuard {
    listener: Rc<ListenerNode>,
    previous: bool,
}

impl TrackingGuard {
    fn suspend(listener: Rc<ListenerNode>) -> Self {
        let previous = listener.tracking.replace(false);
        Self { listener, previous }
    }
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        self.listener.tracking.set(self.previous);
    }
}

impl Runtime {
    /// Run `f` inside a fresh tracking frame for `listener`.
    ///
    /// Every node read while `f` runs becomes a source of the listener, and
    /// sources from the previous run that were not read again are released.
    ///
    /// # Errors
    ///
    /// - [`Error::CyclicDependency`] if the listener is already running.
    /// - [`Error::ContextMisuse`] if a derived computation is running
    ///   anywhere on the stack.
    pub fn run_in_context<R>(
        &self,
        listener: &Rc<ListenerNode>,
        f: impl FnOnce() -> R,
    ) -> Result<R> {
        self.enter(&TargetRef::Listener(listener.clone()), f)
    }

    pub(crate) fn enter<R>(&self, target: &TargetRef, f: impl FnOnce() -> R) -> Result<R> {
        let core = target.core();
        if core.running.get() {
            return Err(Error::CyclicDependency(core.id));
        }
        if let TargetRef::Listener(_) = target {
            if self.context().in_derived() {
                return Err(Error::ContextMisuse(Misuse::EffectInsideDerived));
            }
        }

        let _frame = FrameGuard::enter(self, target.clone());
        Ok(f())
    }

    /// Run `f` without recording any reads as dependencies.
    ///
    /// Scopes nest freely. Effects created inside `f` still track their own
    /// reads.
    ///
    /// # Errors
    ///
    /// [`Error::ContextMisuse`] inside a derived computation, whose cache must
    /// always reflect every read it made.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        if self.context().in_derived() {
            return Err(Error::ContextMisuse(Misuse::UntrackedInsideDerived));
        }

        match self.context().current_target() {
            Some(TargetRef::Listener(listener)) => {
                let _tracking = TrackingGuard::suspend(listener);
                Ok(f())
            }
            _ => Ok(f()),
        }
    }

    /// Record a read of `source` by the current target, if any.
    pub(crate) fn track(&self, source: &SourceRef) {
        let (target, index) = {
            let frame = self.context().frame.borrow();
            match &frame.target {
                Some(target) => (target.clone(), frame.index),
                None => return,
            }
        };
        if let TargetRef::Listener(listener) = &target {
            if !listener.tracking.get() || listener.is_disposed() {
                return;
            }
        }

        let core = target.core();
        let (changed, replaced) = {
            let mut sources = core.sources.borrow_mut();
            if index < sources.len() {
                if sources[index].id() == source.id() {
                    (false, None)
                } else {
                    let old = std::mem::replace(&mut sources[index], source.clone());
                    (true, Some(old))
                }
            } else {
                sources.push(source.clone());
                (true, None)
            }
        };

        if changed {
            if let Some(old) = replaced {
                self.unsubscribe(&old, core.id);
            }
            source.core().subscribe(&target);
        }

        self.context().frame.borrow_mut().index += 1;
    }
}
