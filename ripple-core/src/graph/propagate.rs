//! Invalidation, revalidation, recomputation and rollback.
//!
//! Every target carries a vote count: the number of upstream invalidations it
//! has heard about and not yet resolved, weighted by how many times it read
//! the source that sent them. A target with a non-zero count is invalidated.
//!
//! - A write pushes votes downstream ([`Runtime::invalidate`]). A derived node
//!   forwards the walk only on its first vote, so diamonds are walked once.
//! - A write that is undone, or a recompute that produces the same output,
//!   retracts votes ([`Runtime::uninvalidate`]). A node whose count drops back
//!   to zero retracts its own votes in turn, which is what stops a change
//!   from spreading past a node whose output did not actually change.
//! - Reads pull: an invalidated derived node recomputes when it is read.
//!
//! Inside a transaction, a recomputed derived node holds a draft cache that
//! was computed from draft inputs. If one of those inputs goes back to its
//! committed value before the transaction closes, the draft is rolled back
//! and re-derived against committed state ([`Runtime::rollback`]).

use std::rc::Rc;

use tracing::trace;

use super::node::{AnyDerived, SourceRef, TargetRef};
use crate::error::Result;
use crate::reactive::{RollbackGuard, Runtime};

impl Runtime {
    /// Mark every dependent of `node` stale.
    pub(crate) fn invalidate(&self, node: &SourceRef) {
        if let SourceRef::Derived(derived) = node {
            if derived.target().is_invalidated() {
                return;
            }
            if derived.is_uncommitted() {
                self.rollback(derived);
                return;
            }
        }
        self.push_invalidation(node);
    }

    /// Vote on every live subscriber that does not count `node` as changed
    /// yet, with the multiplicity of its reads.
    fn push_invalidation(&self, node: &SourceRef) {
        trace!(node = %node.id(), "invalidating subscribers");

        let source = node.core();
        for target in source.live_subscribers() {
            if source.is_stale_for(target.id()) {
                continue;
            }
            match target {
                TargetRef::Derived(derived) => {
                    // A rollback in here may already have counted this edge.
                    self.invalidate(&SourceRef::Derived(derived.clone()));
                    derived.target().vote_from(source);
                    self.check_disposal(&derived);
                }
                TargetRef::Listener(listener) => {
                    if listener.is_disposed() {
                        continue;
                    }
                    listener.target.vote_from(source);
                    self.scheduler().schedule_effect(&listener);
                }
            }
        }
    }

    /// Retract the votes `node` holds in its subscribers.
    pub(crate) fn uninvalidate(&self, node: &SourceRef) {
        trace!(node = %node.id(), "revalidating subscribers");

        let source = node.core();
        for target in source.live_subscribers() {
            match target {
                TargetRef::Derived(derived) => {
                    if derived.is_uncommitted() {
                        self.rollback(&derived);
                        continue;
                    }

                    let core = derived.target();
                    if !core.retract_vote_from(source) {
                        continue;
                    }

                    // A running node settles its own votes when it finishes.
                    if !core.is_invalidated() && !core.running.get() {
                        self.uninvalidate(&SourceRef::Derived(derived.clone()));
                    }
                }
                TargetRef::Listener(listener) => {
                    listener.target.retract_vote_from(source);
                }
            }
        }
    }

    /// Bring a derived node up to date if it is uninitialized or invalidated.
    ///
    /// # Errors
    ///
    /// Only [`crate::Error::CyclicDependency`]: faults raised by the derive
    /// closure are cached, not returned.
    pub(crate) fn recompute(&self, node: &Rc<dyn AnyDerived>) -> Result<()> {
        let core = node.target();
        if node.is_initialized() && !core.is_invalidated() {
            return Ok(());
        }

        let unchanged = self.enter(&TargetRef::Derived(node.clone()), || node.evaluate())?;

        if !unchanged {
            node.mark_uncommitted();
            if self.scheduler().in_transaction() {
                self.scheduler()
                    .stage_commit(SourceRef::Derived(node.clone()));
            } else {
                node.commit();
            }
        }

        core.clear_votes();
        self.record(|stats| stats.recomputes += 1);
        trace!(node = %core.id, unchanged, "recomputed");

        if unchanged {
            self.uninvalidate(&SourceRef::Derived(node.clone()));
        }
        Ok(())
    }

    /// Re-derive `node` against committed state without closing the
    /// transaction.
    pub(crate) fn rollback(&self, node: &Rc<dyn AnyDerived>) {
        let core = node.target();
        if core.running.get() {
            return;
        }

        node.revert();
        self.scheduler().unstage_commit(core.id);
        self.record(|stats| stats.rollbacks += 1);
        trace!(node = %core.id, "rolling back");

        let this = SourceRef::Derived(node.clone());

        if !node.has_committed() {
            // First computed inside this transaction: there is no durable
            // state to replay, so start over on the next read.
            for source in core.take_sources() {
                self.unsubscribe(&source, core.id);
            }
            core.invalidated.set(0);
            self.push_invalidation(&this);
            return;
        }

        {
            let _rollback = RollbackGuard::enter(self, node);
            // A cyclic entry cannot happen here: the node is not running.
            let _ = self.enter(&TargetRef::Derived(node.clone()), || node.replay());
        }

        // Count again from scratch, against committed state.
        core.clear_votes();
        for source in core.sources.borrow().iter() {
            if source.is_uncommitted() || source.is_invalidated() {
                core.vote_from(source.core());
            }
        }

        if core.is_invalidated() {
            // Subscribers already counting this node keep their one vote.
            self.push_invalidation(&this);
        } else {
            self.uninvalidate(&this);
        }
    }
}
