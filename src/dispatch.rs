//! Sequence-to-handler dispatch table.
//!
//! Insertions, lookups, removals, and the shutdown drain are all
//! serialized under one lock. The lock is never held across an await or
//! while a handler method runs: cleanup re-acquires the handler's own
//! lock, so it is always invoked after the table lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::handler::SeqHandler;

#[derive(Default)]
pub(crate) struct DispatchTable {
    handlers: Mutex<HashMap<u64, Arc<SeqHandler>>>,
}

impl DispatchTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a sequence. Must happen before the request
    /// is sent, or the reader loop could see the reply first.
    pub(crate) fn register(&self, seq: u64, handler: Arc<SeqHandler>) {
        self.handlers.lock().insert(seq, handler);
    }

    /// Look up the handler for a sequence without removing it.
    pub(crate) fn lookup(&self, seq: u64) -> Option<Arc<SeqHandler>> {
        self.handlers.lock().get(&seq).cloned()
    }

    /// Remove a handler and run its cleanup. A second call for the same
    /// sequence is a no-op.
    pub(crate) fn deregister(&self, seq: u64) {
        let removed = self.handlers.lock().remove(&seq);
        if let Some(handler) = removed {
            handler.cleanup();
        }
    }

    /// Remove every handler and run each cleanup. Used once, at shutdown.
    pub(crate) fn drain(&self) {
        let drained = std::mem::take(&mut *self.handlers.lock());
        for handler in drained.into_values() {
            handler.cleanup();
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, seq: u64) -> bool {
        self.handlers.lock().contains_key(&seq)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.handlers.lock().len()
    }
}
