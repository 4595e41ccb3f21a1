//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph and
//! the edges between them.
//!
//! A node plays one or both of two roles:
//!
//! - A *source* can be read. It keeps a map of the targets subscribed to it.
//!   The map holds weak references only, so an edge never keeps its target
//!   alive. Dead entries stay in the map until the next traversal prunes them.
//! - A *target* reads sources. It strongly owns the list of sources it read
//!   on its last run, in read order, duplicates included.
//!
//! Value cells are sources, listeners are targets, and derived nodes are both.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::error::{Error, Result};

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// The memoized outcome of a derived computation.
#[derive(Debug, Clone)]
pub enum Cache<T> {
    /// The computation succeeded.
    Value(T),

    /// The computation raised a fault. It is re-raised on every read.
    Error(Error),

    /// The computation has not run since creation or disposal.
    Uninitialized,
}

impl<T> Cache<T> {
    /// Whether the cache holds an outcome.
    pub fn is_initialized(&self) -> bool {
        !matches!(self, Cache::Uninitialized)
    }
}

impl<T: Clone> Cache<T> {
    /// Unwrap the cache the way a reader sees it.
    pub(crate) fn resolve(&self, id: NodeId) -> Result<T> {
        match self {
            Cache::Value(value) => Ok(value.clone()),
            Cache::Error(err) => Err(err.clone()),
            Cache::Uninitialized => Err(Error::UnwrapUninitialized(id)),
        }
    }
}

impl<T> From<Result<T>> for Cache<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Cache::Value(value),
            Err(err) => Cache::Error(err),
        }
    }
}

// ----------------------------------------------------------------------------
// Edges
// ----------------------------------------------------------------------------

/// A strong reference to a readable node.
#[derive(Clone)]
pub(crate) enum SourceRef {
    Value(Rc<dyn AnyValue>),
    Derived(Rc<dyn AnyDerived>),
}

impl SourceRef {
    pub(crate) fn core(&self) -> &SourceCore {
        match self {
            SourceRef::Value(node) => node.source(),
            SourceRef::Derived(node) => node.source(),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.core().id
    }

    /// Holds a draft that differs from its committed state.
    pub(crate) fn is_uncommitted(&self) -> bool {
        match self {
            SourceRef::Value(node) => node.is_uncommitted(),
            SourceRef::Derived(node) => node.is_uncommitted(),
        }
    }

    /// Still waiting for an upstream change to be resolved.
    pub(crate) fn is_invalidated(&self) -> bool {
        match self {
            SourceRef::Value(_) => false,
            SourceRef::Derived(node) => node.target().is_invalidated(),
        }
    }

    pub(crate) fn commit(&self) {
        match self {
            SourceRef::Value(node) => node.commit(),
            SourceRef::Derived(node) => node.commit(),
        }
    }
}

/// A strong reference to a node that reads sources.
#[derive(Clone)]
pub(crate) enum TargetRef {
    Derived(Rc<dyn AnyDerived>),
    Listener(Rc<ListenerNode>),
}

impl TargetRef {
    pub(crate) fn core(&self) -> &TargetCore {
        match self {
            TargetRef::Derived(node) => node.target(),
            TargetRef::Listener(node) => &node.target,
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.core().id
    }

    pub(crate) fn downgrade(&self) -> WeakTarget {
        match self {
            TargetRef::Derived(node) => WeakTarget::Derived(Rc::downgrade(node)),
            TargetRef::Listener(node) => WeakTarget::Listener(Rc::downgrade(node)),
        }
    }
}

/// The weak half of a source → target edge.
#[derive(Clone)]
pub(crate) enum WeakTarget {
    Derived(Weak<dyn AnyDerived>),
    Listener(Weak<ListenerNode>),
}

impl WeakTarget {
    pub(crate) fn upgrade(&self) -> Option<TargetRef> {
        match self {
            WeakTarget::Derived(weak) => weak.upgrade().map(TargetRef::Derived),
            WeakTarget::Listener(weak) => weak.upgrade().map(TargetRef::Listener),
        }
    }
}

/// One entry of a source's subscriber map.
struct Subscription {
    target: WeakTarget,

    /// How many times the target read this source on its last run.
    count: usize,

    /// Votes this edge currently holds in the target's count. Zero while the
    /// target is up to date with this source.
    votes: usize,
}

/// State shared by every readable node.
pub(crate) struct SourceCore {
    pub(crate) id: NodeId,
    subscribers: RefCell<IndexMap<NodeId, Subscription>>,
}

impl SourceCore {
    pub(crate) fn new() -> Self {
        Self {
            id: NodeId::new(),
            subscribers: RefCell::new(IndexMap::new()),
        }
    }

    /// Add one read of this source by `target`.
    pub(crate) fn subscribe(&self, target: &TargetRef) {
        self.subscribers
            .borrow_mut()
            .entry(target.id())
            .and_modify(|sub| sub.count += 1)
            .or_insert_with(|| Subscription {
                target: target.downgrade(),
                count: 1,
                votes: 0,
            });
    }

    /// Remove one read of this source by `target`.
    ///
    /// The edge is dropped once the count reaches zero.
    pub(crate) fn unsubscribe(&self, target: NodeId) {
        let mut subscribers = self.subscribers.borrow_mut();
        if let Some(sub) = subscribers.get_mut(&target) {
            sub.count = sub.count.saturating_sub(1);
            if sub.count == 0 {
                subscribers.shift_remove(&target);
            }
        }
    }

    /// Snapshot the subscribers that are still alive.
    ///
    /// Entries whose target has been dropped are pruned on the way.
    pub(crate) fn live_subscribers(&self) -> SmallVec<[TargetRef; 4]> {
        let mut live = SmallVec::new();
        self.subscribers.borrow_mut().retain(|_, sub| match sub.target.upgrade() {
            Some(target) => {
                live.push(target);
                true
            }
            None => false,
        });
        live
    }

    /// Whether `target` already counts this source as changed.
    pub(crate) fn is_stale_for(&self, target: NodeId) -> bool {
        self.subscribers
            .borrow()
            .get(&target)
            .is_some_and(|sub| sub.votes > 0)
    }

    /// Mark the edge to `target` stale, returning the votes it now holds.
    ///
    /// `None` when the edge was already stale or does not exist.
    fn mark_stale(&self, target: NodeId) -> Option<usize> {
        let mut subscribers = self.subscribers.borrow_mut();
        let sub = subscribers.get_mut(&target)?;
        if sub.votes > 0 {
            return None;
        }
        sub.votes = sub.count;
        Some(sub.votes)
    }

    /// Mark the edge to `target` fresh, returning the votes it gave up.
    fn mark_fresh(&self, target: NodeId) -> Option<usize> {
        let mut subscribers = self.subscribers.borrow_mut();
        let sub = subscribers.get_mut(&target)?;
        match std::mem::take(&mut sub.votes) {
            0 => None,
            votes => Some(votes),
        }
    }

    /// Number of live subscribers, pruning dead entries.
    pub(crate) fn live_subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.borrow_mut();
        subscribers.retain(|_, sub| match &sub.target {
            WeakTarget::Derived(weak) => weak.strong_count() > 0,
            WeakTarget::Listener(weak) => weak.strong_count() > 0,
        });
        subscribers.len()
    }

    /// Subscription count held by `target`, zero when not subscribed.
    #[cfg(test)]
    pub(crate) fn subscription_count(&self, target: NodeId) -> usize {
        self.subscribers
            .borrow()
            .get(&target)
            .map(|sub| sub.count)
            .unwrap_or(0)
    }
}

/// State shared by every node that reads sources.
pub(crate) struct TargetCore {
    pub(crate) id: NodeId,

    /// Sources read on the last run, in read order.
    pub(crate) sources: RefCell<SmallVec<[SourceRef; 4]>>,

    /// Set while the node is being evaluated.
    pub(crate) running: Cell<bool>,

    /// Multiplicity-weighted count of upstream invalidations not yet resolved.
    pub(crate) invalidated: Cell<usize>,
}

impl TargetCore {
    pub(crate) fn new() -> Self {
        Self {
            id: NodeId::new(),
            sources: RefCell::new(SmallVec::new()),
            running: Cell::new(false),
            invalidated: Cell::new(0),
        }
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        self.invalidated.get() > 0
    }

    fn add_votes(&self, count: usize) {
        self.invalidated.set(self.invalidated.get() + count);
    }

    fn remove_votes(&self, count: usize) {
        self.invalidated
            .set(self.invalidated.get().saturating_sub(count));
    }

    /// Count `source` as changed. Each edge votes at most once until it is
    /// retracted or the target runs again, so repeated writes to one source
    /// never stack up.
    ///
    /// Returns `false` when the change was already counted.
    pub(crate) fn vote_from(&self, source: &SourceCore) -> bool {
        match source.mark_stale(self.id) {
            Some(votes) => {
                self.add_votes(votes);
                true
            }
            None => false,
        }
    }

    /// Withdraw the vote `source` holds, if any.
    pub(crate) fn retract_vote_from(&self, source: &SourceCore) -> bool {
        match source.mark_fresh(self.id) {
            Some(votes) => {
                self.remove_votes(votes);
                true
            }
            None => false,
        }
    }

    /// Drop every vote: the target is now up to date with all its sources.
    pub(crate) fn clear_votes(&self) {
        for source in self.sources.borrow().iter() {
            source.core().mark_fresh(self.id);
        }
        self.invalidated.set(0);
    }

    /// Take the whole source list, leaving it empty.
    pub(crate) fn take_sources(&self) -> SmallVec<[SourceRef; 4]> {
        std::mem::take(&mut *self.sources.borrow_mut())
    }
}

// ----------------------------------------------------------------------------
// Type-erased node behavior
// ----------------------------------------------------------------------------

/// Operations the engine needs on a value cell, independent of its type.
pub(crate) trait AnyValue {
    fn source(&self) -> &SourceCore;
    fn is_uncommitted(&self) -> bool;
    fn commit(&self);
}

/// Operations the engine needs on a derived node, independent of its type.
pub(crate) trait AnyDerived {
    fn source(&self) -> &SourceCore;
    fn target(&self) -> &TargetCore;

    fn is_uncommitted(&self) -> bool;
    fn mark_uncommitted(&self);
    fn commit(&self);

    fn is_initialized(&self) -> bool;
    fn has_committed(&self) -> bool;

    /// Flag raised while the node re-derives against committed state.
    fn rolling_back(&self) -> &Cell<bool>;

    /// Restore the draft cache from the committed one.
    fn revert(&self);

    /// Drop both caches back to `Uninitialized`.
    fn reset(&self);

    /// Run the derive closure and store the outcome.
    ///
    /// Must be called inside the node's own frame. Returns `true` when the
    /// outcome counts as unchanged, in which case the previous cache is kept.
    fn evaluate(&self) -> bool;

    /// Run the derive closure and discard the outcome.
    fn replay(&self);
}

// ----------------------------------------------------------------------------
// Value cells
// ----------------------------------------------------------------------------

/// A mutable value cell.
pub struct ValueNode<T> {
    pub(crate) source: SourceCore,

    /// The current value, possibly a draft inside a transaction.
    pub(crate) value: RefCell<T>,

    /// The last durable value.
    pub(crate) committed: RefCell<T>,

    /// Set while `value` holds a draft that differs from `committed`.
    pub(crate) pending: Cell<bool>,
}

impl<T: Clone> ValueNode<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            source: SourceCore::new(),
            committed: RefCell::new(value.clone()),
            value: RefCell::new(value),
            pending: Cell::new(false),
        }
    }

    /// The node's unique ID.
    pub fn id(&self) -> NodeId {
        self.source.id
    }

    /// Number of live targets subscribed to this cell.
    pub fn subscriber_count(&self) -> usize {
        self.source.live_subscriber_count()
    }

    pub(crate) fn draft(&self) -> T {
        self.value.borrow().clone()
    }

    pub(crate) fn committed(&self) -> T {
        self.committed.borrow().clone()
    }
}

impl<T: Clone + 'static> AnyValue for ValueNode<T> {
    fn source(&self) -> &SourceCore {
        &self.source
    }

    fn is_uncommitted(&self) -> bool {
        self.pending.get()
    }

    fn commit(&self) {
        if self.pending.replace(false) {
            *self.committed.borrow_mut() = self.value.borrow().clone();
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ValueNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueNode")
            .field("id", &self.source.id)
            .field("value", &self.value.borrow())
            .field("committed", &self.committed.borrow())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Derived nodes
// ----------------------------------------------------------------------------

type DeriveFn<T> = Box<dyn Fn() -> Result<T>>;
type EqFn<T> = Box<dyn Fn(&T, &T) -> bool>;

/// A memoized computation over other nodes.
pub struct DerivedNode<T> {
    pub(crate) source: SourceCore,
    pub(crate) target: TargetCore,
    derive: DeriveFn<T>,
    eq: EqFn<T>,
    pub(crate) value: RefCell<Cache<T>>,
    pub(crate) committed: RefCell<Cache<T>>,
    pending: Cell<bool>,
    rollback: Cell<bool>,
}

impl<T: Clone + 'static> DerivedNode<T> {
    pub(crate) fn new<F, E>(derive: F, eq: E) -> Self
    where
        F: Fn() -> Result<T> + 'static,
        E: Fn(&T, &T) -> bool + 'static,
    {
        Self {
            source: SourceCore::new(),
            target: TargetCore::new(),
            derive: Box::new(derive),
            eq: Box::new(eq),
            value: RefCell::new(Cache::Uninitialized),
            committed: RefCell::new(Cache::Uninitialized),
            pending: Cell::new(false),
            rollback: Cell::new(false),
        }
    }

    /// The node's unique ID.
    pub fn id(&self) -> NodeId {
        self.target.id
    }

    /// Number of live targets subscribed to this node.
    pub fn subscriber_count(&self) -> usize {
        self.source.live_subscriber_count()
    }

    /// Number of source reads recorded on the last run.
    pub fn source_count(&self) -> usize {
        self.target.sources.borrow().len()
    }

    /// Whether the node is waiting on an unresolved upstream change.
    pub fn is_invalidated(&self) -> bool {
        self.target.is_invalidated()
    }

    /// Whether the node currently holds a computed outcome.
    pub fn is_initialized(&self) -> bool {
        self.value.borrow().is_initialized()
    }

    /// Whether `source` was read by this node on its last run.
    pub fn depends_on(&self, source: NodeId) -> bool {
        self.target.sources.borrow().iter().any(|s| s.id() == source)
    }

    pub(crate) fn cache(&self) -> Result<T> {
        self.value.borrow().resolve(self.target.id)
    }

    pub(crate) fn committed_cache(&self) -> Result<T> {
        self.committed.borrow().resolve(self.target.id)
    }
}

impl<T: Clone + 'static> AnyDerived for DerivedNode<T> {
    fn source(&self) -> &SourceCore {
        &self.source
    }

    fn target(&self) -> &TargetCore {
        &self.target
    }

    fn is_uncommitted(&self) -> bool {
        self.pending.get()
    }

    fn mark_uncommitted(&self) {
        self.pending.set(true);
    }

    fn commit(&self) {
        if self.pending.replace(false) {
            *self.committed.borrow_mut() = self.value.borrow().clone();
        }
    }

    fn is_initialized(&self) -> bool {
        self.value.borrow().is_initialized()
    }

    fn has_committed(&self) -> bool {
        self.committed.borrow().is_initialized()
    }

    fn rolling_back(&self) -> &Cell<bool> {
        &self.rollback
    }

    fn revert(&self) {
        *self.value.borrow_mut() = self.committed.borrow().clone();
        self.pending.set(false);
    }

    fn reset(&self) {
        *self.value.borrow_mut() = Cache::Uninitialized;
        *self.committed.borrow_mut() = Cache::Uninitialized;
        self.pending.set(false);
    }

    fn evaluate(&self) -> bool {
        let result = (self.derive)();
        let invalidated = self.target.is_invalidated();

        let mut value = self.value.borrow_mut();
        let unchanged = match (&*value, &result) {
            (Cache::Value(old), Ok(new)) => !invalidated || (self.eq)(old, new),
            (Cache::Error(old), Err(new)) => !invalidated || old.same_as(new),
            _ => false,
        };
        if !unchanged {
            *value = Cache::from(result);
        }
        unchanged
    }

    fn replay(&self) {
        let _ = (self.derive)();
    }
}

impl<T: fmt::Debug> fmt::Debug for DerivedNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedNode")
            .field("id", &self.target.id)
            .field("value", &self.value.borrow())
            .field("invalidated", &self.target.invalidated.get())
            .field("sources", &self.target.sources.borrow().len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Listeners
// ----------------------------------------------------------------------------

type NotifyFn = Box<dyn Fn(&Rc<ListenerNode>) -> Result<()>>;

/// A node that runs a side effect when its sources change.
pub struct ListenerNode {
    pub(crate) target: TargetCore,
    notify: NotifyFn,

    /// Cleared for the duration of an `untracked` scope.
    pub(crate) tracking: Cell<bool>,

    pub(crate) disposed: Cell<bool>,
}

impl ListenerNode {
    pub(crate) fn new<F>(notify: F) -> Self
    where
        F: Fn(&Rc<ListenerNode>) -> Result<()> + 'static,
    {
        Self {
            target: TargetCore::new(),
            notify: Box::new(notify),
            tracking: Cell::new(true),
            disposed: Cell::new(false),
        }
    }

    /// The node's unique ID.
    pub fn id(&self) -> NodeId {
        self.target.id
    }

    /// Number of source reads recorded on the last run.
    pub fn source_count(&self) -> usize {
        self.target.sources.borrow().len()
    }

    /// Whether the listener has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    pub(crate) fn notify(self: &Rc<Self>) -> Result<()> {
        (self.notify)(self)
    }
}

impl fmt::Debug for ListenerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerNode")
            .field("id", &self.target.id)
            .field("invalidated", &self.target.invalidated.get())
            .field("sources", &self.target.sources.borrow().len())
            .field("disposed", &self.disposed.get())
            .finish()
    }
}
