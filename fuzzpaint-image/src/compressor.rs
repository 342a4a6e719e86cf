//! # Update request compression
//!
//! Some sub-objects (selections, masks, ...) keep a derived overlay that is expensive to rebuild. Edits to them
//! arrive in floods from many threads. The compressor unions the requested areas behind a
//! [`CrossThreadDebouncer`] and, once the flood settles, hands the whole area to exactly one
//! [`RecomputeOverlay`] background job.
//!
//! If the subject is not attached to a live document when the debouncer settles, there's nowhere to send the job.
//! The request is then *stalled*: kept intact until [`UpdateRequestCompressor::try_process_stalled_update`] is
//! called after a reattach.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::debouncer::{Coalesce, CrossThreadDebouncer};
use crate::jobs::RecomputeOverlay;
use crate::owner_loop::LoopHandle;
use crate::util::{Rect, UpdateRegion};

pub struct SubjectMarker;
pub type SubjectID = crate::FuzzID<SubjectMarker>;

/// The thing whose overlay is being kept up to date.
pub trait OverlaySubject: Send + Sync + 'static {
    /// The document this subject currently belongs to, if any.
    fn document(&self) -> Option<crate::document::Document>;
    /// Rebuild the overlay within `region`. Called from a worker.
    fn recompute_overlay(&self, region: UpdateRegion);
}

#[derive(Default)]
struct Pending {
    region: UpdateRegion,
    stalled: bool,
}

struct Shared {
    subject_id: SubjectID,
    subject: Weak<dyn OverlaySubject>,
    pending: parking_lot::Mutex<Pending>,
}
impl Shared {
    /// Debouncer settled. Runs on the owner thread.
    fn settle(&self) {
        let document = self.subject.upgrade().and_then(|subject| subject.document());
        let mut pending = self.pending.lock();
        let Some(document) = document else {
            if !pending.stalled {
                log::debug!("{} has no document, update stalled", self.subject_id);
            }
            pending.stalled = true;
            return;
        };
        pending.stalled = false;
        let region = std::mem::take(&mut pending.region);
        drop(pending);

        if region.is_nothing() {
            return;
        }
        document.add_spontaneous_job(Box::new(RecomputeOverlay::new(
            self.subject_id,
            self.subject.clone(),
            region,
        )));
    }
}

pub struct UpdateRequestCompressor {
    shared: Arc<Shared>,
    debouncer: CrossThreadDebouncer,
}
impl UpdateRequestCompressor {
    /// `delay` is the settle period. Settling is handled by `owner`'s loop.
    pub fn new(
        owner: &LoopHandle,
        subject_id: SubjectID,
        subject: Weak<dyn OverlaySubject>,
        delay: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            subject_id,
            subject,
            pending: parking_lot::Mutex::default(),
        });
        let debouncer = {
            let shared = Arc::downgrade(&shared);
            CrossThreadDebouncer::new(owner, delay, Coalesce::FromFirst, move || {
                if let Some(shared) = shared.upgrade() {
                    shared.settle();
                }
            })
        };
        Self { shared, debouncer }
    }
    #[must_use]
    pub fn subject_id(&self) -> SubjectID {
        self.shared.subject_id
    }
    /// Add `rect` to the pending area. An empty rect asks for everything. Callable from any thread.
    pub fn request_update(&self, rect: Rect) {
        self.shared
            .pending
            .lock()
            .region
            .merge(UpdateRegion::from_request(rect));
        self.debouncer.start();
    }
    /// Call after the subject has been attached to a document. Retries a stalled request, if there is one.
    /// Returns whether there was.
    pub fn try_process_stalled_update(&self) -> bool {
        let stalled = self.shared.pending.lock().stalled;
        if stalled {
            self.debouncer.start();
        }
        stalled
    }
    #[must_use]
    pub fn has_stalled_update(&self) -> bool {
        self.shared.pending.lock().stalled
    }
    /// The area accumulated but not yet handed to a job.
    #[must_use]
    pub fn pending_region(&self) -> UpdateRegion {
        self.shared.pending.lock().region
    }
    pub fn set_delay(&self, delay: Duration) {
        self.debouncer.set_delay(delay);
    }
}
