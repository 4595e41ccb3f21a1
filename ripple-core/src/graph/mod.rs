//! Dependency Graph
//!
//! This module implements the node model and the propagation algorithms that
//! keep derived state consistent with the cells it reads.
//!
//! # Overview
//!
//! The graph is made of three kinds of nodes:
//!
//! - Value cells hold mutable state. They are the roots of the graph.
//! - Derived nodes cache the outcome of a computation over other nodes.
//! - Listeners run a side effect when something they read changes.
//!
//! Edges are discovered, never declared: a target's edges are exactly the
//! reads it made on its last run.
//!
//! # Design Decisions
//!
//! 1. Nodes live behind `Rc` and edges are split by direction. A target owns
//!    its sources strongly; a source refers to its subscribers weakly. A node
//!    nobody holds is therefore reclaimed even if it is still listed as a
//!    subscriber somewhere, and the stale entry is pruned on the next walk.
//!
//! 2. Staleness is a vote count rather than a flag, so a node with several
//!    stale inputs stays stale until every one of them has been resolved.
//!    Each edge holds its votes itself and never votes twice, so the count
//!    stays exact across repeated writes and rollbacks.
//!
//! 3. Propagation is push for invalidation and pull for values. Writes only
//!    mark; nothing recomputes until it is read or a listener needs it.

mod disposal;
mod node;
mod propagate;
mod scheduler;

pub use node::{Cache, DerivedNode, ListenerNode, NodeId, ValueNode};
pub use scheduler::BatchStatus;

pub(crate) use node::{AnyDerived, SourceRef, TargetRef};
pub(crate) use scheduler::UpdateScheduler;
