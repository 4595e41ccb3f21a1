//! Subscription release and disposal.
//!
//! A derived node that is invalidated and has no live subscriber left will
//! never be read through the graph again before it recomputes from scratch,
//! so its cache and upstream edges are released. Releasing the edges can in
//! turn leave an upstream derived node unobserved, so disposal cascades
//! through the whole stale sub-graph.
//!
//! While a write or transaction is open, eligible nodes are only recorded and
//! re-checked at settlement; a node that regains a subscriber or is
//! revalidated in the meantime survives.

use std::rc::Rc;

use tracing::trace;

use super::node::{AnyDerived, ListenerNode, NodeId, SourceRef};
use crate::reactive::Runtime;

impl Runtime {
    /// Release one read of `source` by `target`.
    pub(crate) fn unsubscribe(&self, source: &SourceRef, target: NodeId) {
        source.core().unsubscribe(target);
        if let SourceRef::Derived(derived) = source {
            self.check_disposal(derived);
        }
    }

    /// Dispose `node` now, or at settlement, if it is eligible.
    pub(crate) fn check_disposal(&self, node: &Rc<dyn AnyDerived>) {
        if !Self::is_disposable(node) {
            return;
        }
        if self.scheduler().in_transaction() {
            self.scheduler().defer_disposal(node);
        } else {
            self.dispose_derived(node);
        }
    }

    fn is_disposable(node: &Rc<dyn AnyDerived>) -> bool {
        let core = node.target();
        core.is_invalidated()
            && !core.running.get()
            && node.source().live_subscriber_count() == 0
    }

    /// Reset `node` to `Uninitialized` and release its upstream edges.
    pub(crate) fn dispose_derived(&self, node: &Rc<dyn AnyDerived>) {
        let core = node.target();
        let sources = core.take_sources();
        node.reset();
        core.invalidated.set(0);

        self.record(|stats| stats.disposals += 1);
        trace!(node = %core.id, sources = sources.len(), "disposed derived node");

        for source in sources {
            self.unsubscribe(&source, core.id);
        }
    }

    /// Detach a listener from every source it tracks.
    ///
    /// A disposed listener never runs again. Disposing twice is a no-op.
    pub fn dispose(&self, listener: &Rc<ListenerNode>) {
        if listener.disposed.replace(true) {
            return;
        }

        let core = &listener.target;
        core.invalidated.set(0);
        self.scheduler().unschedule_effect(core.id);
        trace!(node = %core.id, "disposed listener");

        for source in core.take_sources() {
            self.unsubscribe(&source, core.id);
        }
    }
}
