//! Error Types
//!
//! Every fallible operation in the engine returns [`Result`]. Errors are
//! cheap to clone because a derived node caches the fault its computation
//! raised and hands a copy to every later reader, exactly like a cached value.

use std::fmt;
use std::rc::Rc;

use crate::graph::NodeId;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Ways the execution context can be misused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misuse {
    /// An effect frame was opened while a derived computation was running.
    EffectInsideDerived,

    /// A value cell was written while a derived computation was running.
    WriteInsideDerived,

    /// `untracked` was called while a derived computation was running.
    UntrackedInsideDerived,
}

impl fmt::Display for Misuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            Misuse::EffectInsideDerived => "an effect cannot run inside a derived computation",
            Misuse::WriteInsideDerived => "a value cannot be written inside a derived computation",
            Misuse::UntrackedInsideDerived => {
                "untracked reads are not allowed inside a derived computation"
            }
        };
        f.write_str(what)
    }
}

/// Errors raised by the engine or by user computations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A target was entered again while it was already running.
    #[error("cyclic dependency detected while evaluating {0}")]
    CyclicDependency(NodeId),

    /// A context rule was broken.
    #[error("context misuse: {0}")]
    ContextMisuse(Misuse),

    /// A cache was unwrapped before it was ever computed.
    #[error("{0} was read before it was initialized")]
    UnwrapUninitialized(NodeId),

    /// A settlement flush ran more effects than the configured limit.
    #[error("effect flush exceeded the limit of {limit} notifications")]
    RunawayFlush { limit: usize },

    /// A fault raised by a derive closure or an effect body.
    #[error("{0}")]
    User(Fault),
}

impl Error {
    /// Check whether two errors are the same outcome.
    ///
    /// User faults compare by identity, engine errors by value.
    pub fn same_as(&self, other: &Error) -> bool {
        match (self, other) {
            (Error::CyclicDependency(a), Error::CyclicDependency(b)) => a == b,
            (Error::ContextMisuse(a), Error::ContextMisuse(b)) => a == b,
            (Error::UnwrapUninitialized(a), Error::UnwrapUninitialized(b)) => a == b,
            (Error::RunawayFlush { limit: a }, Error::RunawayFlush { limit: b }) => a == b,
            (Error::User(a), Error::User(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Build a user fault from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::User(Fault::msg(message))
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Error::User(fault)
    }
}

/// A shared, type-erased fault raised by user code.
///
/// Cloning a `Fault` shares the underlying error, so a cached fault re-raised
/// to many readers stays the *same* fault.
#[derive(Clone)]
pub struct Fault(Rc<dyn std::error::Error + 'static>);

impl Fault {
    /// Wrap an arbitrary error.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Self(Rc::new(error))
    }

    /// Build a fault carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self(Rc::new(Message(message.into())))
    }

    /// Borrow the wrapped error.
    pub fn get_ref(&self) -> &(dyn std::error::Error + 'static) {
        &*self.0
    }

    /// Attempt to downcast the wrapped error.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &Fault) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<E> From<E> for Fault
where
    E: std::error::Error + 'static,
{
    fn from(error: E) -> Self {
        Fault::new(error)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fault").field(&self.0).finish()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}
