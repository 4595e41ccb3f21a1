//! Reactive Primitives
//!
//! This module hosts the runtime and the typed handles built on it: signals,
//! memos, and effects.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! while a memo or effect runs, the signal registers that computation as a
//! dependent. When the signal's value changes, all dependents are invalidated.
//!
//! ## Memos
//!
//! A Memo is a derived value that caches its result. It re-evaluates only when
//! one of its dependencies changes, and only when it is read.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change, once per settled write or batch.
//!
//! # Implementation Notes
//!
//! Dependency tracking is ambient but not global: every [`Runtime`] carries
//! its own execution context, and a read is recorded against whichever
//! target that runtime is currently evaluating.

mod batch;
mod context;
mod effect;
mod memo;
mod runtime;
mod signal;

pub use effect::Effect;
pub use memo::Memo;
pub use runtime::{FaultHandler, Runtime, RuntimeStats};
pub use signal::Signal;

pub(crate) use context::RollbackGuard;
