//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects value cells, derived
//! nodes and listeners. It owns the execution context (which target is
//! running) and the update context (which writes are waiting to settle).
//!
//! # How It Works
//!
//! 1. Nodes are created through the runtime and handed out as `Rc` handles.
//!
//! 2. When a target reads a node, the runtime records the read as an edge.
//!
//! 3. When a cell is written, the runtime:
//!    a. Pushes invalidation votes to every dependent
//!    b. Collects listeners into the pending set
//!    c. Settles: commits the write, sweeps unobserved stale nodes, and runs
//!       the pending listeners
//!    d. Derived nodes are lazy - they recompute on next read
//!
//! # Thread Safety
//!
//! None. A runtime and every node created from it belong to one thread; the
//! handle is `!Send` and `!Sync`. Independent runtimes share nothing.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use serde::Serialize;
use tracing::error;

use super::context::ExecutionContext;
use crate::config::RuntimeConfig;
use crate::error::{Error, Misuse, Result};
use crate::graph::{
    AnyDerived, BatchStatus, DerivedNode, ListenerNode, SourceRef, UpdateScheduler, ValueNode,
};

/// A replaceable handler for faults nobody else can receive.
pub type FaultHandler = Rc<dyn Fn(&Error)>;

/// Cumulative counters describing the work a runtime has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    /// Derive closures run to refresh a cache.
    pub recomputes: u64,

    /// Derived drafts re-derived against committed state.
    pub rollbacks: u64,

    /// Derived nodes reset because they were stale and unobserved.
    pub disposals: u64,

    /// Listener notifications delivered.
    pub notifications: u64,

    /// Writes or transactions settled.
    pub settlements: u64,
}

struct RuntimeState {
    context: ExecutionContext,
    scheduler: UpdateScheduler,
    config: RuntimeConfig,
    fault_handler: RefCell<Option<FaultHandler>>,
    stats: Cell<RuntimeStats>,
}

/// Handle to an incremental computation graph.
///
/// Cloning the handle is cheap and shares the same graph.
#[derive(Clone)]
pub struct Runtime {
    state: Rc<RuntimeState>,
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime with the given configuration.
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            state: Rc::new(RuntimeState {
                context: ExecutionContext::default(),
                scheduler: UpdateScheduler::default(),
                config,
                fault_handler: RefCell::new(None),
                stats: Cell::new(RuntimeStats::default()),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.state.config
    }

    pub(crate) fn context(&self) -> &ExecutionContext {
        &self.state.context
    }

    pub(crate) fn scheduler(&self) -> &UpdateScheduler {
        &self.state.scheduler
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Create a value cell.
    pub fn make_value_node<T>(&self, initial: T) -> Rc<ValueNode<T>>
    where
        T: Clone + 'static,
    {
        Rc::new(ValueNode::new(initial))
    }

    /// Create a derived node. Equal outputs (by `PartialEq`) do not
    /// propagate to dependents.
    ///
    /// The closure does not run until the node is first read.
    pub fn make_derived_node<T, F>(&self, derive: F) -> Rc<DerivedNode<T>>
    where
        T: Clone + PartialEq + 'static,
        F: Fn() -> Result<T> + 'static,
    {
        Rc::new(DerivedNode::new(derive, |a: &T, b: &T| a == b))
    }

    /// Create a derived node with a custom "unchanged" predicate.
    pub fn make_derived_node_with<T, F, E>(&self, derive: F, eq: E) -> Rc<DerivedNode<T>>
    where
        T: Clone + 'static,
        F: Fn() -> Result<T> + 'static,
        E: Fn(&T, &T) -> bool + 'static,
    {
        Rc::new(DerivedNode::new(derive, eq))
    }

    /// Create a listener. `notify` runs whenever the listener is settled as
    /// invalidated; it usually re-runs a body through [`Runtime::run_in_context`].
    pub fn make_listener_node<F>(&self, notify: F) -> Rc<ListenerNode>
    where
        F: Fn(&Rc<ListenerNode>) -> Result<()> + 'static,
    {
        Rc::new(ListenerNode::new(notify))
    }

    // ------------------------------------------------------------------
    // Reads and writes
    // ------------------------------------------------------------------

    /// Read a value cell, recording the read on the current target.
    pub fn get_value<T>(&self, node: &Rc<ValueNode<T>>) -> T
    where
        T: Clone + 'static,
    {
        self.track(&SourceRef::Value(node.clone()));
        if self.context().in_rollback() {
            node.committed()
        } else {
            node.draft()
        }
    }

    /// Read a derived node, recomputing it first if needed.
    ///
    /// # Errors
    ///
    /// Re-raises the fault cached by the node's last computation, or
    /// [`Error::CyclicDependency`] if the node is already being computed.
    pub fn get_derived<T>(&self, node: &Rc<DerivedNode<T>>) -> Result<T>
    where
        T: Clone + 'static,
    {
        if node.target.running.get() {
            return Err(Error::CyclicDependency(node.id()));
        }

        let erased: Rc<dyn AnyDerived> = node.clone();
        self.track(&SourceRef::Derived(erased.clone()));

        if self.context().in_rollback() && erased.has_committed() {
            return node.committed_cache();
        }

        self.recompute(&erased)?;
        node.cache()
    }

    /// Write a value cell.
    ///
    /// Writing the current value is a no-op. Otherwise dependents are
    /// invalidated and, outside a batch, the write settles before returning.
    /// Inside a batch, writing a cell back to its committed value retracts
    /// the invalidation it caused earlier in the same batch.
    ///
    /// # Errors
    ///
    /// [`Error::ContextMisuse`] inside a derived computation.
    pub fn set_value<T>(&self, node: &Rc<ValueNode<T>>, value: T) -> Result<()>
    where
        T: Clone + PartialEq + 'static,
    {
        if self.context().in_derived() {
            return Err(Error::ContextMisuse(Misuse::WriteInsideDerived));
        }
        if *node.value.borrow() == value {
            return Ok(());
        }

        let reverted = *node.committed.borrow() == value;
        let single = self.scheduler().begin_write();
        *node.value.borrow_mut() = value;

        let source = SourceRef::Value(node.clone());
        if reverted {
            node.pending.set(false);
            self.scheduler().unstage_commit(node.id());
            self.uninvalidate(&source);
        } else {
            if !node.pending.replace(true) {
                self.scheduler().stage_commit(source.clone());
            }
            self.invalidate(&source);
        }

        if single {
            self.scheduler().set_status(BatchStatus::Inactive);
            self.settle();
        }
        Ok(())
    }

    /// Current transaction status.
    pub fn status(&self) -> BatchStatus {
        self.scheduler().status()
    }

    // ------------------------------------------------------------------
    // Faults and diagnostics
    // ------------------------------------------------------------------

    /// Replace the handler that receives faults raised by listeners.
    pub fn set_fault_handler<F>(&self, handler: F)
    where
        F: Fn(&Error) + 'static,
    {
        *self.state.fault_handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// Remove the custom fault handler, restoring the default one.
    pub fn take_fault_handler(&self) -> Option<FaultHandler> {
        self.state.fault_handler.borrow_mut().take()
    }

    pub(crate) fn report_fault(&self, err: &Error) {
        let handler = self.state.fault_handler.borrow().clone();
        match handler {
            Some(handler) => handler(err),
            None => error!(error = %err, "unhandled fault in listener"),
        }
    }

    /// Snapshot of the runtime's counters.
    pub fn stats(&self) -> RuntimeStats {
        self.state.stats.get()
    }

    pub(crate) fn record(&self, f: impl FnOnce(&mut RuntimeStats)) {
        let mut stats = self.state.stats.get();
        f(&mut stats);
        self.state.stats.set(stats);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("status", &self.status())
            .field("pending_effects", &self.scheduler().pending_effects())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn derived_node_computes_lazily_and_caches() {
        let rt = Runtime::new();
        let runs = Rc::new(Cell::new(0));
        let derived = rt.make_derived_node({
            let runs = runs.clone();
            move || {
                runs.set(runs.get() + 1);
                Ok(42)
            }
        });

        assert!(!derived.is_initialized());
        assert_eq!(runs.get(), 0);

        assert_eq!(rt.get_derived(&derived).unwrap(), 42);
        assert_eq!(rt.get_derived(&derived).unwrap(), 42);
        assert_eq!(runs.get(), 1);
        assert_eq!(rt.stats().recomputes, 1);
    }

    #[test]
    fn writing_the_same_value_is_a_no_op() {
        let rt = Runtime::new();
        let cell = rt.make_value_node(3);
        rt.set_value(&cell, 3).unwrap();
        assert_eq!(rt.stats().settlements, 0);

        rt.set_value(&cell, 4).unwrap();
        assert_eq!(rt.get_value(&cell), 4);
        assert_eq!(cell.committed(), 4);
        assert_eq!(rt.stats().settlements, 1);
    }

    #[test]
    fn write_inside_derived_is_refused() {
        let rt = Runtime::new();
        let cell = rt.make_value_node(0);
        let derived = rt.make_derived_node({
            let rt = rt.clone();
            let cell = cell.clone();
            move || {
                rt.set_value(&cell, 1)?;
                Ok(())
            }
        });

        assert!(matches!(
            rt.get_derived(&derived),
            Err(Error::ContextMisuse(Misuse::WriteInsideDerived))
        ));
        assert_eq!(rt.get_value(&cell), 0);
    }

    #[test]
    fn derive_fault_is_cached_and_reraised() {
        let rt = Runtime::new();
        let runs = Rc::new(Cell::new(0));
        let derived = rt.make_derived_node::<i32, _>({
            let runs = runs.clone();
            move || {
                runs.set(runs.get() + 1);
                Err(Error::msg("no answer"))
            }
        });

        let first = rt.get_derived(&derived).unwrap_err();
        let second = rt.get_derived(&derived).unwrap_err();
        assert!(first.same_as(&second));
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn custom_fault_handler_receives_listener_faults() {
        let rt = Runtime::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        rt.set_fault_handler({
            let seen = seen.clone();
            move |err| seen.borrow_mut().push(err.to_string())
        });

        let listener = rt.make_listener_node(|_| Err(Error::msg("listener failed")));
        rt.run_listener(&listener);

        assert_eq!(*seen.borrow(), vec!["listener failed".to_string()]);
        assert!(listener.is_disposed());
        assert!(rt.take_fault_handler().is_some());
        assert!(rt.take_fault_handler().is_none());
    }

    #[test]
    fn stats_serialize_to_json() {
        let rt = Runtime::new();
        let json = serde_json::to_value(rt.stats()).unwrap();
        assert_eq!(json["recomputes"], 0);
        assert_eq!(json["settlements"], 0);
    }
}
