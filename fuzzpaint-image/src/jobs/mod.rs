//! # Jobs
//!
//! Two flavors of work reach the scheduler:
//! * [`StrokeJob`]s, which belong to exactly one stroke and are ordered by their [`Sequentiality`].
//! * [`BackgroundJob`]s, which belong to no stroke at all. They are low priority, and a newer job may swallow
//!   an older queued one of the same kind via [`BackgroundJob::overrides`], so that a flood of identical
//!   requests never grows the queue.
//!
//! Both may ask for [`Exclusivity::Exclusive`], in which case nothing else runs alongside them.

pub mod overlay;
pub mod projection;
pub mod recycle;

pub use overlay::RecomputeOverlay;
pub use projection::ProjectionUpdate;
pub use recycle::RecycleBuffers;

/// Ordering of a job relative to its siblings in the same stroke.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default, strum::AsRefStr)]
pub enum Sequentiality {
    /// Runs after every previous sequential job of the stroke has finished.
    #[default]
    Sequential,
    /// May overlap with any sibling, except barriers.
    Concurrent,
    /// Waits for every previous job of the stroke, and every later job waits for it.
    Barrier,
}

/// Ordering of a job relative to *all* other work.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default, strum::AsRefStr)]
pub enum Exclusivity {
    #[default]
    Normal,
    /// Runs only when no other job, of any stroke or in the background, is executing.
    Exclusive,
}

type Work = Box<dyn FnOnce() + Send>;

/// One unit of a stroke's work.
pub struct StrokeJob {
    pub sequentiality: Sequentiality,
    pub exclusivity: Exclusivity,
    work: Work,
}
impl StrokeJob {
    pub fn new(
        sequentiality: Sequentiality,
        exclusivity: Exclusivity,
        work: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            sequentiality,
            exclusivity,
            work: Box::new(work),
        }
    }
    pub fn sequential(work: impl FnOnce() + Send + 'static) -> Self {
        Self::new(Sequentiality::Sequential, Exclusivity::Normal, work)
    }
    pub fn concurrent(work: impl FnOnce() + Send + 'static) -> Self {
        Self::new(Sequentiality::Concurrent, Exclusivity::Normal, work)
    }
    pub fn barrier(work: impl FnOnce() + Send + 'static) -> Self {
        Self::new(Sequentiality::Barrier, Exclusivity::Normal, work)
    }
    #[must_use]
    pub fn exclusive(mut self) -> Self {
        self.exclusivity = Exclusivity::Exclusive;
        self
    }
    /// Wrap the work in `wrapper`, which is handed the original work to call (or not).
    #[must_use]
    pub fn wrap(self, wrapper: impl FnOnce(Work) + Send + 'static) -> Self {
        let Self {
            sequentiality,
            exclusivity,
            work,
        } = self;
        Self {
            sequentiality,
            exclusivity,
            work: Box::new(move || wrapper(work)),
        }
    }
    /// Split into the flags and the bare work, for schedulers.
    #[must_use]
    pub fn into_parts(self) -> (Sequentiality, Exclusivity, Work) {
        (self.sequentiality, self.exclusivity, self.work)
    }
    pub fn run(self) {
        (self.work)();
    }
}
impl std::fmt::Debug for StrokeJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrokeJob")
            .field("sequentiality", &self.sequentiality)
            .field("exclusivity", &self.exclusivity)
            .finish_non_exhaustive()
    }
}

/// Work not bound to any stroke.
pub trait BackgroundJob: Send + 'static {
    /// Short name, for logs.
    fn name(&self) -> &'static str;
    fn exclusivity(&self) -> Exclusivity {
        Exclusivity::Normal
    }
    /// Called when `self` is about to be queued while `older` is still waiting to run.
    /// Returning true means `self` takes over `older`'s duty (merging any state it needs), and `older` is discarded.
    fn overrides(&mut self, older: &dyn BackgroundJob) -> bool;
    fn run(self: Box<Self>);
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Measures how long a stroke job waited and ran, reported through `log::trace!`.
pub(crate) struct TimingProbe {
    label: String,
    submitted: std::time::Instant,
}
impl TimingProbe {
    pub(crate) fn new(label: String) -> Self {
        Self {
            label,
            submitted: std::time::Instant::now(),
        }
    }
    /// Attach this probe to the job.
    pub(crate) fn instrument(self, job: StrokeJob) -> StrokeJob {
        // No-one listening, don't bother wrapping.
        if !log::log_enabled!(log::Level::Trace) {
            return job;
        }
        let (sequentiality, exclusivity) = (job.sequentiality, job.exclusivity);
        job.wrap(move |work| {
            let started = std::time::Instant::now();
            work();
            log::trace!(
                "{} ({}, {}) queued {:?}, ran {:?}",
                self.label,
                sequentiality.as_ref(),
                exclusivity.as_ref(),
                started - self.submitted,
                started.elapsed()
            );
        })
    }
}

#[cfg(test)]
mod test {
    use super::{Exclusivity, Sequentiality, StrokeJob};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn wrap_keeps_flags_and_work() {
        let count = Arc::new(AtomicUsize::new(0));
        let job = {
            let count = count.clone();
            StrokeJob::concurrent(move || {
                count.fetch_add(1, Ordering::Relaxed);
            })
            .exclusive()
        };
        let wrapped = {
            let count = count.clone();
            job.wrap(move |work| {
                count.fetch_add(10, Ordering::Relaxed);
                work();
            })
        };
        assert_eq!(wrapped.sequentiality, Sequentiality::Concurrent);
        assert_eq!(wrapped.exclusivity, Exclusivity::Exclusive);
        wrapped.run();
        assert_eq!(count.load(Ordering::Relaxed), 11);
    }
}
