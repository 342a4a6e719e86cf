//! # Scheduler
//!
//! The [`Scheduler`] is what actually runs jobs on threads. The document only ever talks to it through this trait,
//! and layers its own locking, filtering and notification rules on top. [`ThreadPoolScheduler`] is the
//! implementation used in practice.

pub mod pool;
pub(crate) mod queue;

pub use pool::ThreadPoolScheduler;

use std::sync::Arc;

use crate::jobs::{BackgroundJob, StrokeJob};
use crate::stroke::{StrokeID, StrokeStrategy};

bitflags::bitflags! {
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
    pub struct LodFlags : u8 {
        /// The image can be worked on at a reduced level of detail at all.
        const SUPPORTED = 0b01;
        /// The user wants it to be.
        const PREFERRED = 0b10;
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LodPreferences {
    pub flags: LodFlags,
    /// Level to work at when enabled. Each level halves the resolution.
    pub desired_level: u8,
}
impl Default for LodPreferences {
    fn default() -> Self {
        crate::config::LodConfig::default().into()
    }
}
impl LodPreferences {
    #[must_use]
    pub fn lod_supported(&self) -> bool {
        self.flags.contains(LodFlags::SUPPORTED)
    }
    #[must_use]
    pub fn lod_preferred(&self) -> bool {
        self.flags.contains(LodFlags::PREFERRED)
    }
    /// Regeneration is worth doing at all.
    #[must_use]
    pub fn lod_enabled(&self) -> bool {
        self.lod_supported() && self.lod_preferred()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("a scheduler needs at least one worker")]
    ZeroWorkers,
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Executes strokes and background jobs.
///
/// Locking here is a single level - the document keeps count of nesting, and only locks or unlocks the
/// scheduler at the outermost level.
pub trait Scheduler: Send + Sync + 'static {
    fn start_stroke(&self, strategy: Arc<dyn StrokeStrategy>) -> StrokeID;
    /// Jobs for unknown or cancelled strokes are dropped.
    fn add_job(&self, stroke: StrokeID, job: StrokeJob);
    fn end_stroke(&self, stroke: StrokeID);
    /// Returns true if this call cancelled the stroke.
    fn cancel_stroke(&self, stroke: StrokeID) -> bool;
    /// Cancel whatever is running without waiting, if every stroke has been ended by its creator.
    /// Returns false if that's not the case and nothing happened.
    fn try_cancel_current_stroke_async(&self) -> bool;
    fn add_background_job(&self, job: Box<dyn BackgroundJob>);

    /// Halt dispatch and wait for running jobs. Queued ones stay queued.
    fn lock(&self);
    /// Like [`Scheduler::lock`], for access that won't modify the image.
    fn immediate_lock_for_read_only(&self);
    /// Wait for every dispatchable job to finish, then halt dispatch.
    fn barrier_lock(&self);
    /// [`Scheduler::barrier_lock`] if it would not block, otherwise do nothing and return false.
    fn try_barrier_lock(&self) -> bool;
    /// Resume dispatch. `reset_lod` discards reduced-detail data, since the image may have changed underneath it.
    fn unlock(&self, reset_lod: bool);

    /// Nothing queued, nothing running, and no open strokes.
    fn is_idle(&self) -> bool;
    /// Block until every dispatchable job has finished.
    fn wait_for_done(&self);

    fn current_level_of_detail(&self) -> u8;
    fn lod_preferences(&self) -> LodPreferences;
    fn set_lod_preferences(&self, preferences: LodPreferences);
    /// Rebuild reduced-detail data, unconditionally.
    fn explicit_regenerate_level_of_detail(&self);

    /// Is the caller one of this scheduler's workers?
    fn is_worker_thread(&self) -> bool {
        false
    }
}

#[cfg(test)]
pub(crate) mod test {
    //! Single-threaded scheduler where the test decides when things run.

    use super::queue::Queues;
    use super::{LodPreferences, Scheduler};
    use crate::jobs::{BackgroundJob, StrokeJob};
    use crate::stroke::{StrokeID, StrokeStrategy};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    pub(crate) struct ManualScheduler {
        queues: parking_lot::Mutex<Queues>,
        lod: parking_lot::Mutex<LodPreferences>,
        pub(crate) regenerations: AtomicUsize,
        pub(crate) lod_resets: AtomicUsize,
    }
    impl ManualScheduler {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }
        pub(crate) fn background_len(&self) -> usize {
            self.queues.lock().background_len()
        }
        pub(crate) fn is_locked(&self) -> bool {
            self.queues.lock().locked
        }
        /// Run everything that can run, in dispatch order, on this thread.
        pub(crate) fn run_all(&self) -> usize {
            let mut queues = self.queues.lock();
            let mut count = 0;
            while let Some(dispatched) = queues.next_task() {
                parking_lot::MutexGuard::unlocked(&mut queues, || dispatched.task.run());
                queues.finish(dispatched.ticket);
                count += 1;
            }
            count
        }
    }
    impl Scheduler for ManualScheduler {
        fn start_stroke(&self, strategy: Arc<dyn StrokeStrategy>) -> StrokeID {
            self.queues.lock().start_stroke(strategy)
        }
        fn add_job(&self, stroke: StrokeID, job: StrokeJob) {
            self.queues.lock().add_job(stroke, job);
        }
        fn end_stroke(&self, stroke: StrokeID) {
            self.queues.lock().end_stroke(stroke);
        }
        fn cancel_stroke(&self, stroke: StrokeID) -> bool {
            self.queues.lock().cancel_stroke(stroke)
        }
        fn try_cancel_current_stroke_async(&self) -> bool {
            self.queues.lock().try_cancel_current()
        }
        fn add_background_job(&self, job: Box<dyn BackgroundJob>) {
            self.queues.lock().add_background_job(job);
        }
        fn lock(&self) {
            self.queues.lock().locked = true;
        }
        fn immediate_lock_for_read_only(&self) {
            self.queues.lock().locked = true;
        }
        fn barrier_lock(&self) {
            self.run_all();
            self.queues.lock().locked = true;
        }
        fn try_barrier_lock(&self) -> bool {
            let mut queues = self.queues.lock();
            if queues.has_queued() {
                false
            } else {
                queues.locked = true;
                true
            }
        }
        fn unlock(&self, reset_lod: bool) {
            self.queues.lock().locked = false;
            if reset_lod {
                self.lod_resets.fetch_add(1, Ordering::SeqCst);
            }
        }
        fn is_idle(&self) -> bool {
            self.queues.lock().is_idle()
        }
        fn wait_for_done(&self) {
            self.run_all();
        }
        fn current_level_of_detail(&self) -> u8 {
            let lod = self.lod.lock();
            if lod.lod_enabled() {
                lod.desired_level
            } else {
                0
            }
        }
        fn lod_preferences(&self) -> LodPreferences {
            *self.lod.lock()
        }
        fn set_lod_preferences(&self, preferences: LodPreferences) {
            *self.lod.lock() = preferences;
        }
        fn explicit_regenerate_level_of_detail(&self) {
            self.regenerations.fetch_add(1, Ordering::SeqCst);
        }
    }
}
