//! # Scratch buffers
//!
//! A stroke often needs a temporary buffer shaped like some existing one (a layer's pixels, a mask...). The next
//! stroke wants the same thing, and allocating one per stroke is wasteful, so released buffers are pooled.
//!
//! The catch is that a job of the *previous* stroke may still be running with a reference to the buffer when it is
//! released. Clearing it right away, or handing it straight back out, would pull it from under that job. So a
//! released buffer becomes *dirty*, and only turns *clean* (reusable) inside an exclusive [`RecycleBuffers`] job,
//! when by construction nothing else is running.
//!
//! ```text
//!  fetch ──► current ──release──► dirty ──(exclusive job)──► clean ──fetch──► current
//! ```

use std::sync::{Arc, Weak};

use crate::document::WeakDocument;
use crate::jobs::recycle::RecycleTarget;
use crate::jobs::RecycleBuffers;

pub struct StoreMarker;
pub type StoreID = crate::FuzzID<StoreMarker>;

/// Which family of buffer. Buffers are only ever reused within the same kind.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, strum::AsRefStr)]
pub enum BufferKind {
    Pixels,
    Mask,
}

/// The buffer storage this store pools. Pixel semantics are entirely up to the implementor.
pub trait ScratchBuffer: Clone + Send + Sync + 'static {
    fn kind(&self) -> BufferKind;
    /// Could `self` stand in for `prototype` as-is? (Same kind, same pixel format, ...)
    fn is_compatible(&self, prototype: &Self) -> bool;
    /// A new, empty buffer shaped like `prototype`.
    #[must_use]
    fn new_like(prototype: &Self) -> Self;
    /// Reshape a recycled buffer to match `prototype`, reusing whatever allocation it can.
    fn reshape_like(&mut self, prototype: &Self);
    fn clear(&mut self);
    /// Blend `source` onto `self` within `rect`.
    fn composite(&mut self, source: &Self, rect: crate::util::Rect);
}

/// A pooled buffer, shared between the store and whichever jobs are using it.
pub type SharedBuffer<B> = Arc<parking_lot::RwLock<B>>;

struct Pools<B> {
    current: Option<SharedBuffer<B>>,
    dirty: Vec<SharedBuffer<B>>,
    clean: Vec<SharedBuffer<B>>,
}
impl<B> Default for Pools<B> {
    fn default() -> Self {
        Self {
            current: None,
            dirty: Vec::new(),
            clean: Vec::new(),
        }
    }
}

struct StoreInner<B> {
    id: StoreID,
    pools: parking_lot::Mutex<Pools<B>>,
    document: parking_lot::Mutex<WeakDocument>,
}
impl<B: ScratchBuffer> RecycleTarget for StoreInner<B> {
    fn recycle_in_safety(&self) {
        // Lock held throughout - `fetch` must never observe a half-recycled pool.
        let mut pools = self.pools.lock();
        let Pools { dirty, clean, .. } = &mut *pools;
        if dirty.is_empty() {
            return;
        }
        log::trace!("{} recycling {} buffers", self.id, dirty.len());
        for buffer in dirty.drain(..) {
            buffer.write().clear();
            clean.push(buffer);
        }
    }
}

pub struct SafeScratchBufferStore<B: ScratchBuffer> {
    inner: Arc<StoreInner<B>>,
}
impl<B: ScratchBuffer> Default for SafeScratchBufferStore<B> {
    fn default() -> Self {
        Self::new(WeakDocument::new())
    }
}
impl<B: ScratchBuffer> SafeScratchBufferStore<B> {
    /// Create an empty store whose subject lives in `document`.
    #[must_use]
    pub fn new(document: WeakDocument) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                id: StoreID::next(),
                pools: parking_lot::Mutex::default(),
                document: parking_lot::Mutex::new(document),
            }),
        }
    }
    #[must_use]
    pub fn id(&self) -> StoreID {
        self.inner.id
    }
    /// The subject moved to another document, or was detached (`WeakDocument::new()`).
    pub fn set_document(&self, document: WeakDocument) {
        *self.inner.document.lock() = document;
    }
    /// Get the current scratch buffer, creating or recycling one shaped like `prototype` if needed.
    ///
    /// The result is never a buffer awaiting recycling.
    pub fn fetch(&self, prototype: &B) -> SharedBuffer<B> {
        let mut pools = self.inner.pools.lock();
        if let Some(current) = pools.current.as_ref() {
            if current.read().is_compatible(prototype) {
                return current.clone();
            }
        }
        // Incompatible current buffer - retire it like a normal release.
        let retired = if let Some(current) = pools.current.take() {
            pools.dirty.push(current);
            true
        } else {
            false
        };

        let kind = prototype.kind();
        let reusable = pools
            .clean
            .iter()
            .rposition(|buffer| buffer.read().kind() == kind);
        let buffer = if let Some(idx) = reusable {
            let buffer = pools.clean.swap_remove(idx);
            buffer.write().reshape_like(prototype);
            buffer
        } else {
            log::trace!("{} allocating a {} buffer", self.inner.id, kind.as_ref());
            Arc::new(parking_lot::RwLock::new(B::new_like(prototype)))
        };
        pools.current = Some(buffer.clone());
        drop(pools);

        if retired {
            self.schedule_recycle();
        }
        buffer
    }
    /// Retire the current buffer. It will be cleared and made reusable once that is safe.
    pub fn release(&self) {
        let released = {
            let mut pools = self.inner.pools.lock();
            if let Some(current) = pools.current.take() {
                pools.dirty.push(current);
                true
            } else {
                false
            }
        };
        if released {
            self.schedule_recycle();
        }
    }
    fn schedule_recycle(&self) {
        let document = self.inner.document.lock().upgrade();
        if let Some(document) = document {
            let target = Arc::downgrade(&self.inner);
            let target: Weak<dyn RecycleTarget> = target;
            document.add_spontaneous_job(Box::new(RecycleBuffers::new(self.inner.id, target)));
        } else {
            // No document means no scheduler, and no jobs that could still be using the buffers.
            self.inner.recycle_in_safety();
        }
    }
    /// Clear all dirty buffers and make them reusable.
    ///
    /// Only call this when no job may be using buffers from this store - normally it is run for you by an
    /// exclusive [`RecycleBuffers`] job.
    pub fn recycle_in_safety(&self) {
        self.inner.recycle_in_safety();
    }
    #[must_use]
    pub fn has_buffer(&self) -> bool {
        self.inner.pools.lock().current.is_some()
    }
    /// Number of (dirty, clean) pooled buffers.
    #[must_use]
    pub fn pooled(&self) -> (usize, usize) {
        let pools = self.inner.pools.lock();
        (pools.dirty.len(), pools.clean.len())
    }
}
impl<B: ScratchBuffer> Clone for SafeScratchBufferStore<B> {
    /// Deep-copies the current buffer. Pool history is not carried over - the clone starts out with empty pools.
    fn clone(&self) -> Self {
        let current = self
            .inner
            .pools
            .lock()
            .current
            .as_ref()
            .map(|current| Arc::new(parking_lot::RwLock::new(current.read().clone())));
        let document = self.inner.document.lock().clone();
        Self {
            inner: Arc::new(StoreInner {
                id: StoreID::next(),
                pools: parking_lot::Mutex::new(Pools {
                    current,
                    ..Pools::default()
                }),
                document: parking_lot::Mutex::new(document),
            }),
        }
    }
}
