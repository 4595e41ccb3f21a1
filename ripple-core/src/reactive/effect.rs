//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately to establish
//!    initial dependencies.
//!
//! 2. When any dependency changes, the effect is scheduled and re-runs when
//!    the write (or the enclosing batch) settles.
//!
//! 3. Every run re-tracks from scratch; inputs that were not read again are
//!    released.
//!
//! # Differences from Memo
//!
//! - Memos return a value; effects do not.
//! - Memos are lazy (compute on access); effects are eager (run when deps change).
//! - Memos cache results; effects just run their side effect.
//!
//! # Cleanup
//!
//! An effect built with [`Effect::with_cleanup`] returns a cleanup function
//! from every run. It is called before the effect re-runs and when the effect
//! is disposed.
//!
//! # Faults
//!
//! A run that returns an error is reported to the runtime's fault handler
//! and the effect disposes itself.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use super::runtime::Runtime;
use crate::error::Result;
use crate::graph::{ListenerNode, NodeId};

type Cleanup = Box<dyn FnOnce()>;

#[derive(Default)]
struct EffectState {
    runs: Cell<usize>,
    cleanup: RefCell<Option<Cleanup>>,
}

impl EffectState {
    fn cleanup(&self) {
        let cleanup = self.cleanup.borrow_mut().take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }
}

/// A side-effecting computation that runs when dependencies change.
///
/// Dropping the handle disposes the effect.
///
/// # Example
///
/// ```rust
/// use ripple_core::{Effect, Runtime, Signal};
/// use std::cell::RefCell;
/// use std::rc::Rc;
///
/// let rt = Runtime::new();
/// let count = Signal::new(&rt, 0);
/// let seen = Rc::new(RefCell::new(Vec::new()));
///
/// let _effect = Effect::new(&rt, {
///     let (count, seen) = (count.clone(), seen.clone());
///     move || {
///         seen.borrow_mut().push(count.get());
///         Ok(())
///     }
/// });
///
/// count.set(5).unwrap();
/// assert_eq!(*seen.borrow(), vec![0, 5]);
/// ```
pub struct Effect {
    rt: Runtime,
    node: Rc<ListenerNode>,
    state: Rc<EffectState>,
}

impl Effect {
    /// Create a new effect with the given function.
    ///
    /// The function runs immediately to establish initial dependencies.
    pub fn new<F>(rt: &Runtime, run: F) -> Self
    where
        F: Fn() -> Result<()> + 'static,
    {
        let effect = Self::new_lazy(rt, run);
        effect.run();
        effect
    }

    /// Create a new effect whose runs each return a cleanup function.
    pub fn with_cleanup<F, C>(rt: &Runtime, run: F) -> Self
    where
        F: Fn() -> Result<C> + 'static,
        C: FnOnce() + 'static,
    {
        let effect = Self::build(rt, move || {
            let cleanup = run()?;
            Ok(Some(Box::new(cleanup) as Cleanup))
        });
        effect.run();
        effect
    }

    /// Create a new effect without running it immediately.
    ///
    /// The effect tracks nothing until [`Effect::run`] is called.
    pub fn new_lazy<F>(rt: &Runtime, run: F) -> Self
    where
        F: Fn() -> Result<()> + 'static,
    {
        Self::build(rt, move || run().map(|()| None))
    }

    fn build<F>(rt: &Runtime, body: F) -> Self
    where
        F: Fn() -> Result<Option<Cleanup>> + 'static,
    {
        let state = Rc::new(EffectState::default());
        let node = rt.make_listener_node({
            let rt = rt.clone();
            let state = state.clone();
            move |this| {
                state.cleanup();
                state.runs.set(state.runs.get() + 1);
                let cleanup = rt.run_in_context(this, &body)??;
                *state.cleanup.borrow_mut() = cleanup;
                Ok(())
            }
        });

        Self {
            rt: rt.clone(),
            node,
            state,
        }
    }

    /// Run the effect now, re-tracking its dependencies.
    pub fn run(&self) {
        self.rt.run_listener(&self.node);
    }

    /// Get the effect's unique ID.
    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    /// Dispose of the effect.
    ///
    /// After disposal, the effect will not run again.
    pub fn dispose(&self) {
        self.rt.dispose(&self.node);
        self.state.cleanup();
    }

    /// Check if the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.node.is_disposed()
    }

    /// Get the number of times the effect has run.
    pub fn run_count(&self) -> usize {
        self.state.runs.get()
    }

    /// Number of reads the last run made, duplicates included.
    pub fn source_count(&self) -> usize {
        self.node.source_count()
    }

    /// The underlying graph node.
    pub fn node(&self) -> &Rc<ListenerNode> {
        &self.node
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.node.id())
            .field("run_count", &self.run_count())
            .field("source_count", &self.source_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::reactive::Signal;

    #[test]
    fn effect_runs_on_creation() {
        let rt = Runtime::new();
        let effect = Effect::new(&rt, || Ok(()));
        assert_eq!(effect.run_count(), 1);
    }

    #[test]
    fn effect_lazy_does_not_run_on_creation() {
        let rt = Runtime::new();
        let signal = Signal::new(&rt, 0);
        let effect = Effect::new_lazy(&rt, {
            let signal = signal.clone();
            move || {
                signal.get();
                Ok(())
            }
        });

        assert_eq!(effect.run_count(), 0);
        assert_eq!(signal.subscriber_count(), 0);

        effect.run();
        assert_eq!(effect.run_count(), 1);
        assert_eq!(signal.subscriber_count(), 1);
    }

    #[test]
    fn effect_reruns_when_dependency_changes() {
        let rt = Runtime::new();
        let signal = Signal::new(&rt, 0);
        let effect = Effect::new(&rt, {
            let signal = signal.clone();
            move || {
                signal.get();
                Ok(())
            }
        });

        signal.set(1).unwrap();
        signal.set(2).unwrap();
        assert_eq!(effect.run_count(), 3);
    }

    #[test]
    fn effect_does_not_run_after_disposal() {
        let rt = Runtime::new();
        let signal = Signal::new(&rt, 0);
        let effect = Effect::new(&rt, {
            let signal = signal.clone();
            move || {
                signal.get();
                Ok(())
            }
        });

        effect.dispose();
        assert!(effect.is_disposed());
        assert_eq!(signal.subscriber_count(), 0);

        signal.set(1).unwrap();
        effect.run();
        assert_eq!(effect.run_count(), 1);
    }

    #[test]
    fn cleanup_runs_before_rerun_and_on_drop() {
        let rt = Runtime::new();
        let signal = Signal::new(&rt, 0);
        let cleanups = Rc::new(Cell::new(0));

        let effect = Effect::with_cleanup(&rt, {
            let signal = signal.clone();
            let cleanups = cleanups.clone();
            move || {
                signal.get();
                let cleanups = cleanups.clone();
                Ok(move || cleanups.set(cleanups.get() + 1))
            }
        });
        assert_eq!(cleanups.get(), 0);

        signal.set(1).unwrap();
        assert_eq!(cleanups.get(), 1);

        drop(effect);
        assert_eq!(cleanups.get(), 2);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn faulting_effect_disposes_itself() {
        let rt = Runtime::new();
        let reported = Rc::new(Cell::new(0));
        rt.set_fault_handler({
            let reported = reported.clone();
            move |_| reported.set(reported.get() + 1)
        });

        let signal = Signal::new(&rt, 0);
        let effect = Effect::new(&rt, {
            let signal = signal.clone();
            move || {
                if signal.get() > 0 {
                    return Err(Error::msg("too big"));
                }
                Ok(())
            }
        });
        assert!(!effect.is_disposed());

        signal.set(1).unwrap();
        assert_eq!(reported.get(), 1);
        assert!(effect.is_disposed());
        assert_eq!(signal.subscriber_count(), 0);

        signal.set(2).unwrap();
        assert_eq!(effect.run_count(), 2);
    }
}
