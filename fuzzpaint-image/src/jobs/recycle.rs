//! Deferred recycling of released scratch buffers. See [`crate::scratch`].

use std::sync::Weak;

use crate::scratch::StoreID;

/// The store side of a recycling job. Implemented by the scratch store internals.
pub(crate) trait RecycleTarget: Send + Sync {
    /// Clear every dirty buffer and make it available for reuse.
    /// Only sound to call while nothing else may be using the buffers.
    fn recycle_in_safety(&self);
}

/// Recycles the dirty buffers of one store. Always exclusive: a job of a previous stroke may still be
/// holding one of the buffers, and clearing it under that job's feet is exactly what this exists to prevent.
pub struct RecycleBuffers {
    store: StoreID,
    target: Weak<dyn RecycleTarget>,
}
impl RecycleBuffers {
    pub(crate) fn new(store: StoreID, target: Weak<dyn RecycleTarget>) -> Self {
        Self { store, target }
    }
    #[must_use]
    pub fn store(&self) -> StoreID {
        self.store
    }
}
impl super::BackgroundJob for RecycleBuffers {
    fn name(&self) -> &'static str {
        "recycle-buffers"
    }
    fn exclusivity(&self) -> super::Exclusivity {
        super::Exclusivity::Exclusive
    }
    fn overrides(&mut self, older: &dyn super::BackgroundJob) -> bool {
        // One pass recycles everything dirty at the time it runs, which covers the older request too.
        older
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|older| older.store == self.store)
    }
    fn run(self: Box<Self>) {
        if let Some(target) = self.target.upgrade() {
            target.recycle_in_safety();
        } else {
            // Store dropped along with its buffers, nothing left to protect.
            log::trace!("{} gone before recycling", self.store);
        }
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
