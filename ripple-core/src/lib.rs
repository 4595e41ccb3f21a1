//! Ripple Core
//!
//! This crate provides a fine-grained incremental computation engine: a graph
//! of mutable cells and derived computations that stays up to date as cells
//! change, without dependencies ever being declared. It implements:
//!
//! - Value cells, memoized derived nodes and listeners
//! - Automatic dependency tracking
//! - Push invalidation with pull recomputation, glitch-free
//! - Transactions with rollback of abandoned drafts
//! - Automatic disposal of stale, unobserved derived state
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - `graph`: node model, propagation, scheduling and disposal
//! - `reactive`: the runtime, its execution context, and typed handles
//!
//! # Example
//!
//! ```rust
//! use ripple_core::{Effect, Memo, Runtime, Signal};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let rt = Runtime::new();
//! let count = Signal::new(&rt, 0);
//!
//! let doubled = Memo::new(&rt, {
//!     let count = count.clone();
//!     move || Ok(count.get() * 2)
//! });
//!
//! let log = Rc::new(RefCell::new(Vec::new()));
//! let _effect = Effect::new(&rt, {
//!     let (doubled, log) = (doubled.clone(), log.clone());
//!     move || {
//!         log.borrow_mut().push(doubled.get()?);
//!         Ok(())
//!     }
//! });
//!
//! count.set(1).unwrap();
//! count.set(2).unwrap();
//! assert_eq!(*log.borrow(), vec![0, 2, 4]);
//! ```

pub mod graph;
pub mod reactive;

mod config;
mod error;

pub use config::{ConfigError, RuntimeConfig};
pub use error::{Error, Fault, Misuse, Result};
pub use graph::{BatchStatus, Cache, DerivedNode, ListenerNode, NodeId, ValueNode};
pub use reactive::{Effect, FaultHandler, Memo, Runtime, RuntimeStats, Signal};
