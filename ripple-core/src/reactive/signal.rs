//! Signal Implementation
//!
//! A Signal is the typed handle to a value cell. It holds a value and
//! tracks which computations depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read while a memo or effect runs, the running target
//!    is subscribed to the signal.
//!
//! 2. When a signal's value changes, every subscriber is invalidated.
//!
//! 3. Invalidated effects re-run when the write settles; memos recompute on
//!    their next read.

use std::fmt;
use std::rc::Rc;

use super::runtime::Runtime;
use crate::error::Result;
use crate::graph::{NodeId, ValueNode};

/// A reactive signal holding a value of type T.
///
/// Cloning a signal clones the handle; both clones refer to the same cell.
///
/// # Example
///
/// ```rust
/// use ripple_core::{Runtime, Signal};
///
/// let rt = Runtime::new();
/// let count = Signal::new(&rt, 0);
///
/// count.set(5).unwrap();
/// count.update(|n| n + 1).unwrap();
/// assert_eq!(count.get(), 6);
/// ```
pub struct Signal<T> {
    rt: Runtime,
    node: Rc<ValueNode<T>>,
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + 'static,
{
    /// Create a new signal with the given initial value.
    pub fn new(rt: &Runtime, value: T) -> Self {
        Self {
            rt: rt.clone(),
            node: rt.make_value_node(value),
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    /// Get the current value.
    ///
    /// If called while a memo or effect runs, this also registers the
    /// running computation as a subscriber.
    pub fn get(&self) -> T {
        self.rt.get_value(&self.node)
    }

    /// Get the current value without tracking dependencies.
    ///
    /// # Errors
    ///
    /// [`crate::Error::ContextMisuse`] inside a memo computation.
    pub fn get_untracked(&self) -> Result<T> {
        self.rt.untracked(|| self.rt.get_value(&self.node))
    }

    /// Set a new value and invalidate subscribers.
    ///
    /// Setting the current value does nothing.
    ///
    /// # Errors
    ///
    /// [`crate::Error::ContextMisuse`] inside a memo computation.
    pub fn set(&self, value: T) -> Result<()> {
        self.rt.set_value(&self.node, value)
    }

    /// Update the value using a function of the current one.
    ///
    /// The current value is read without being tracked.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.node.draft();
        self.set(f(&current))
    }

    /// Number of computations currently subscribed to this signal.
    pub fn subscriber_count(&self) -> usize {
        self.node.subscriber_count()
    }

    /// The underlying graph node.
    pub fn node(&self) -> &Rc<ValueNode<T>> {
        &self.node
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            node: Rc::clone(&self.node),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.node.source.id)
            .field("value", &self.node.value.borrow())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
