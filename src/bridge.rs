//! Interface the surrounding reconcile loop uses to publish its own writes
//! to the parent into the Mounter's generation ledger.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::mounter::MounterState;

/// Lets the [`Reconciler`](crate::reconciler::Reconciler) cooperate with the
/// Mounter's echo filter: every successful user-driven write to the parent
/// must be published here, or the Mounter's next parent watch event will
/// look like an unrelated change rather than the handler's own write.
#[derive(Clone)]
pub struct ReconcileBridge {
    state: Arc<Mutex<MounterState>>,
}

impl ReconcileBridge {
    pub(crate) fn new(state: Arc<Mutex<MounterState>>) -> Self {
        ReconcileBridge { state }
    }

    pub fn parent_generation(&self) -> i64 {
        self.state.lock().ledger.parent_generation()
    }

    /// Records a generation the reconcile loop just wrote to the parent.
    /// Only call this after a write that actually advanced `generation` —
    /// a no-op write must not move the ledger forward.
    pub fn set_parent_generation(&self, generation: i64) {
        self.state.lock().ledger.set_parent_generation(generation);
    }
}
