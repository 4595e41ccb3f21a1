//! Memo Implementation
//!
//! A Memo is a derived value that caches its result. It recomputes only when
//! one of its dependencies has actually changed.
//!
//! # Laziness
//!
//! A memo never runs on its own. A write only marks it invalidated; the
//! computation runs the next time the memo is read, by user code or by an
//! effect that depends on it. A memo that is invalidated while nothing
//! subscribes to it is disposed: its cache is dropped and it stops listening
//! to its own inputs until it is read again.
//!
//! # Equality
//!
//! When a recomputation produces a value equal to the cached one, dependents
//! are told that nothing changed and keep their own caches. `Memo::new` uses
//! `PartialEq`; `Memo::with_eq` takes any predicate.

use std::fmt;
use std::rc::Rc;

use super::runtime::Runtime;
use crate::error::Result;
use crate::graph::{DerivedNode, NodeId};

/// A cached derived value that recomputes only when dependencies change.
///
/// # Example
///
/// ```rust
/// use ripple_core::{Memo, Runtime, Signal};
///
/// let rt = Runtime::new();
/// let count = Signal::new(&rt, 3);
/// let doubled = Memo::new(&rt, {
///     let count = count.clone();
///     move || Ok(count.get() * 2)
/// });
///
/// assert_eq!(doubled.get().unwrap(), 6);
/// count.set(5).unwrap();
/// assert_eq!(doubled.get().unwrap(), 10);
/// ```
pub struct Memo<T> {
    rt: Runtime,
    node: Rc<DerivedNode<T>>,
}

impl<T> Memo<T>
where
    T: Clone + PartialEq + 'static,
{
    /// Create a new memo with the given computation.
    ///
    /// The computation is not run immediately. It runs on first access.
    pub fn new<F>(rt: &Runtime, compute: F) -> Self
    where
        F: Fn() -> Result<T> + 'static,
    {
        Self {
            rt: rt.clone(),
            node: rt.make_derived_node(compute),
        }
    }
}

impl<T> Memo<T>
where
    T: Clone + 'static,
{
    /// Create a memo whose output counts as unchanged when `eq` says so.
    pub fn with_eq<F, E>(rt: &Runtime, compute: F, eq: E) -> Self
    where
        F: Fn() -> Result<T> + 'static,
        E: Fn(&T, &T) -> bool + 'static,
    {
        Self {
            rt: rt.clone(),
            node: rt.make_derived_node_with(compute, eq),
        }
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// # Errors
    ///
    /// The fault raised by the last computation, re-raised on every read
    /// until a recomputation succeeds, or [`crate::Error::CyclicDependency`]
    /// when read from inside its own computation.
    pub fn get(&self) -> Result<T> {
        self.rt.get_derived(&self.node)
    }

    /// Get the memo's unique ID.
    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    /// Number of computations currently subscribed to this memo.
    pub fn subscriber_count(&self) -> usize {
        self.node.subscriber_count()
    }

    /// Number of reads the last computation made, duplicates included.
    pub fn source_count(&self) -> usize {
        self.node.source_count()
    }

    /// Whether a cached outcome is present.
    pub fn is_initialized(&self) -> bool {
        self.node.is_initialized()
    }

    pub fn is_invalidated(&self) -> bool {
        self.node.is_invalidated()
    }

    /// The underlying graph node.
    pub fn node(&self) -> &Rc<DerivedNode<T>> {
        &self.node
    }
}

impl<T> Clone for Memo<T> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            node: Rc::clone(&self.node),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Memo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.node, f)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
