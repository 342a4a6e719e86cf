//! Dispatch bookkeeping, shared by every scheduler in the crate. Pure state, no threads - callers hold it behind
//! their own lock, ask it for the [`Queues::next_task`] and report back with [`Queues::finish`].
//!
//! Rules:
//! * Strokes execute in start order. Only the front stroke dispatches, the rest wait their turn.
//! * Within the stroke, a `Sequential` job waits for running sequential jobs, a `Concurrent` one doesn't, and a
//!   `Barrier` waits for everything of the stroke. Nothing of the stroke starts while a barrier runs.
//! * `Exclusive` jobs wait for *everything* to finish, and nothing starts while they run.
//! * An exclusive background job anywhere in the background queue takes priority over strokes.
//!   Other background jobs fill in only when no stroke job can start.
//! * A background job that absorbs queued ones takes the queue slot of the first it absorbed.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::jobs::{BackgroundJob, Exclusivity, Sequentiality, StrokeJob};
use crate::stroke::{StrokeID, StrokeStrategy};

type Work = Box<dyn FnOnce() + Send>;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum JobRole {
    Init,
    Work,
    Finish,
    Cancel,
}

struct QueuedJob {
    role: JobRole,
    sequentiality: Sequentiality,
    exclusivity: Exclusivity,
    work: Work,
}

struct StrokeEntry {
    id: StrokeID,
    strategy: Arc<dyn StrokeStrategy>,
    jobs: VecDeque<QueuedJob>,
    /// Init has been dispatched. Before that, cancelling needs no cleanup.
    started: bool,
    ended: bool,
    cancelled: bool,
    running: usize,
    running_sequential: usize,
    running_barrier: bool,
}
impl StrokeEntry {
    fn lifecycle_job(&self, role: JobRole, callback: fn(&dyn StrokeStrategy)) -> QueuedJob {
        let strategy = self.strategy.clone();
        QueuedJob {
            role,
            sequentiality: Sequentiality::Barrier,
            exclusivity: self.strategy.exclusivity(),
            work: Box::new(move || callback(strategy.as_ref())),
        }
    }
    fn can_start(&self, job: &QueuedJob) -> bool {
        match job.sequentiality {
            Sequentiality::Sequential => !self.running_barrier && self.running_sequential == 0,
            Sequentiality::Concurrent => !self.running_barrier,
            Sequentiality::Barrier => self.running == 0,
        }
    }
    fn is_done(&self) -> bool {
        self.ended && self.jobs.is_empty() && self.running == 0
    }
    /// Drop everything queued and, if the strategy already got to run, have it clean up.
    fn cancel(&mut self) {
        self.jobs.clear();
        if self.started {
            let cancel = self.lifecycle_job(JobRole::Cancel, |strategy| strategy.cancel_stroke());
            self.jobs.push_back(cancel);
        }
        self.ended = true;
        self.cancelled = true;
    }
}

enum Pick {
    ExclusiveBackground(usize),
    Stroke,
    Background,
}

/// Identifies a dispatched task to [`Queues::finish`].
pub(crate) struct Ticket {
    stroke: Option<StrokeID>,
    sequentiality: Sequentiality,
    exclusive: bool,
}

pub(crate) enum Task {
    Stroke(Work),
    Background(Box<dyn BackgroundJob>),
}
impl Task {
    pub(crate) fn run(self) {
        match self {
            Self::Stroke(work) => work(),
            Self::Background(job) => job.run(),
        }
    }
}

pub(crate) struct Dispatched {
    pub(crate) ticket: Ticket,
    pub(crate) task: Task,
}

#[derive(Default)]
pub(crate) struct Queues {
    strokes: VecDeque<StrokeEntry>,
    background: VecDeque<Box<dyn BackgroundJob>>,
    running: usize,
    running_exclusive: bool,
    /// Dispatch is halted. Running tasks still finish, queues still accept work.
    pub(crate) locked: bool,
}
impl Queues {
    fn find(&mut self, id: StrokeID) -> Option<&mut StrokeEntry> {
        self.strokes.iter_mut().find(|stroke| stroke.id == id)
    }
    /// Drop finished strokes from the front, letting the next one dispatch.
    fn prune(&mut self) {
        while self.strokes.front().is_some_and(StrokeEntry::is_done) {
            if let Some(stroke) = self.strokes.pop_front() {
                log::trace!(
                    "{} \"{}\" retired{}",
                    stroke.id,
                    stroke.strategy.name(),
                    if stroke.cancelled { " (cancelled)" } else { "" }
                );
            }
        }
    }
    /// Strokes nobody is adding to anymore may be cut short, if they said that's fine.
    fn cancel_forgettable(&mut self) {
        if self.strokes.is_empty() || self.strokes.iter().any(|stroke| !stroke.ended) {
            return;
        }
        for stroke in &mut self.strokes {
            if !stroke.cancelled && stroke.strategy.can_forget_about_me() {
                log::debug!("Forgetting {}", stroke.id);
                stroke.cancel();
            }
        }
        self.prune();
    }
    pub(crate) fn start_stroke(&mut self, strategy: Arc<dyn StrokeStrategy>) -> StrokeID {
        self.cancel_forgettable();
        let mut stroke = StrokeEntry {
            id: StrokeID::next(),
            strategy,
            jobs: VecDeque::new(),
            started: false,
            ended: false,
            cancelled: false,
            running: 0,
            running_sequential: 0,
            running_barrier: false,
        };
        let init = stroke.lifecycle_job(JobRole::Init, |strategy| strategy.init_stroke());
        stroke.jobs.push_back(init);
        let id = stroke.id;
        log::trace!(
            "{id} \"{}\" started with {:?}",
            stroke.strategy.name(),
            stroke.strategy.flags()
        );
        self.strokes.push_back(stroke);
        id
    }
    pub(crate) fn add_job(&mut self, id: StrokeID, job: StrokeJob) {
        let Some(stroke) = self.find(id) else {
            log::debug!("Job for unknown {id} dropped");
            return;
        };
        if stroke.cancelled {
            log::debug!("Job for cancelled {id} dropped");
            return;
        }
        if stroke.ended {
            debug_assert!(false, "job added to ended {id}");
            log::error!("Job added to ended {id}, dropped");
            return;
        }
        let (sequentiality, exclusivity, work) = job.into_parts();
        stroke.jobs.push_back(QueuedJob {
            role: JobRole::Work,
            sequentiality,
            exclusivity,
            work,
        });
    }
    pub(crate) fn end_stroke(&mut self, id: StrokeID) {
        let Some(stroke) = self.find(id) else {
            log::debug!("End of unknown {id} ignored");
            return;
        };
        if stroke.cancelled {
            return;
        }
        if stroke.ended {
            debug_assert!(false, "{id} ended twice");
            log::error!("{id} ended twice");
            return;
        }
        stroke.ended = true;
        let finish = stroke.lifecycle_job(JobRole::Finish, |strategy| strategy.finish_stroke());
        stroke.jobs.push_back(finish);
    }
    /// Returns true if this call cancelled the stroke.
    pub(crate) fn cancel_stroke(&mut self, id: StrokeID) -> bool {
        let Some(stroke) = self.find(id) else {
            return false;
        };
        if stroke.cancelled {
            return false;
        }
        stroke.cancel();
        self.prune();
        true
    }
    /// Cancel every stroke, but only if each one has already been ended by its creator.
    pub(crate) fn try_cancel_current(&mut self) -> bool {
        if self.strokes.is_empty() || self.strokes.iter().any(|stroke| !stroke.ended) {
            return false;
        }
        for stroke in &mut self.strokes {
            if !stroke.cancelled {
                stroke.cancel();
            }
        }
        self.prune();
        true
    }
    pub(crate) fn add_background_job(&mut self, mut job: Box<dyn BackgroundJob>) {
        let before = self.background.len();
        let mut kept = 0;
        let mut slot = None;
        self.background.retain(|older| {
            if job.overrides(older.as_ref()) {
                if slot.is_none() {
                    slot = Some(kept);
                }
                false
            } else {
                kept += 1;
                true
            }
        });
        let merged = before - self.background.len();
        if merged != 0 {
            log::trace!("{} absorbed {merged} queued", job.name());
        }
        match slot {
            Some(slot) => self.background.insert(slot, job),
            None => self.background.push_back(job),
        }
    }
    fn pick(&self) -> Option<Pick> {
        if let Some(idx) = self
            .background
            .iter()
            .position(|job| job.exclusivity() == Exclusivity::Exclusive)
        {
            // Holds everything else back until it gets its window.
            return (self.running == 0).then_some(Pick::ExclusiveBackground(idx));
        }
        if self.running_exclusive {
            return None;
        }
        if let Some(stroke) = self.strokes.front() {
            if let Some(job) = stroke.jobs.front() {
                let exclusive_ok = job.exclusivity == Exclusivity::Normal || self.running == 0;
                if exclusive_ok && stroke.can_start(job) {
                    return Some(Pick::Stroke);
                }
            }
        }
        (!self.background.is_empty()).then_some(Pick::Background)
    }
    fn take_background(&mut self, idx: usize) -> Option<Dispatched> {
        let job = self.background.remove(idx)?;
        let exclusive = job.exclusivity() == Exclusivity::Exclusive;
        Some(Dispatched {
            ticket: Ticket {
                stroke: None,
                sequentiality: Sequentiality::Concurrent,
                exclusive,
            },
            task: Task::Background(job),
        })
    }
    /// Take the next task allowed to start now, if any.
    pub(crate) fn next_task(&mut self) -> Option<Dispatched> {
        if self.locked {
            return None;
        }
        let dispatched = match self.pick()? {
            Pick::ExclusiveBackground(idx) => self.take_background(idx)?,
            Pick::Background => self.take_background(0)?,
            Pick::Stroke => {
                let stroke = self.strokes.front_mut()?;
                let job = stroke.jobs.pop_front()?;
                if job.role == JobRole::Init {
                    stroke.started = true;
                }
                stroke.running += 1;
                match job.sequentiality {
                    Sequentiality::Sequential => stroke.running_sequential += 1,
                    Sequentiality::Barrier => stroke.running_barrier = true,
                    Sequentiality::Concurrent => (),
                }
                Dispatched {
                    ticket: Ticket {
                        stroke: Some(stroke.id),
                        sequentiality: job.sequentiality,
                        exclusive: job.exclusivity == Exclusivity::Exclusive,
                    },
                    task: Task::Stroke(job.work),
                }
            }
        };
        self.running += 1;
        if dispatched.ticket.exclusive {
            self.running_exclusive = true;
        }
        Some(dispatched)
    }
    pub(crate) fn finish(&mut self, ticket: Ticket) {
        self.running -= 1;
        if ticket.exclusive {
            self.running_exclusive = false;
        }
        if let Some(id) = ticket.stroke {
            if let Some(stroke) = self.find(id) {
                stroke.running -= 1;
                match ticket.sequentiality {
                    Sequentiality::Sequential => stroke.running_sequential -= 1,
                    Sequentiality::Barrier => stroke.running_barrier = false,
                    Sequentiality::Concurrent => (),
                }
            }
            self.prune();
        }
    }
    #[must_use]
    pub(crate) fn running(&self) -> usize {
        self.running
    }
    /// Nothing running, and nothing that could start once unlocked.
    /// Open strokes with nothing queued don't count.
    #[must_use]
    pub(crate) fn is_drained(&self) -> bool {
        self.running == 0 && (self.locked || self.pick().is_none())
    }
    /// Any job queued at all, dispatchable or not.
    #[must_use]
    pub(crate) fn has_queued(&self) -> bool {
        !self.background.is_empty() || self.strokes.iter().any(|stroke| !stroke.jobs.is_empty())
    }
    /// Drained, and not a single stroke around.
    #[must_use]
    pub(crate) fn is_idle(&self) -> bool {
        self.running == 0 && self.strokes.is_empty() && self.background.is_empty()
    }
    #[cfg(test)]
    pub(crate) fn background_len(&self) -> usize {
        self.background.len()
    }
    #[cfg(test)]
    pub(crate) fn stroke_count(&self) -> usize {
        self.strokes.len()
    }
}

#[cfg(test)]
mod test {
    use super::{Dispatched, Queues, Task};
    use crate::jobs::{BackgroundJob, Exclusivity, StrokeJob};
    use crate::stroke::{SimpleStrokeStrategy, StrokeFlags};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Tagged {
        tag: u32,
        exclusive: bool,
    }
    impl BackgroundJob for Tagged {
        fn name(&self) -> &'static str {
            "tagged"
        }
        fn exclusivity(&self) -> Exclusivity {
            if self.exclusive {
                Exclusivity::Exclusive
            } else {
                Exclusivity::Normal
            }
        }
        fn overrides(&mut self, older: &dyn BackgroundJob) -> bool {
            older
                .as_any()
                .downcast_ref::<Self>()
                .is_some_and(|older| older.tag == self.tag)
        }
        fn run(self: Box<Self>) {}
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn background_tag(dispatched: &Dispatched) -> Option<u32> {
        match &dispatched.task {
            Task::Background(job) => job.as_any().downcast_ref::<Tagged>().map(|job| job.tag),
            Task::Stroke(_) => None,
        }
    }
    fn strategy() -> Arc<SimpleStrokeStrategy> {
        Arc::new(SimpleStrokeStrategy::new("test"))
    }
    /// Run tasks one at a time until nothing can start.
    fn run_serially(queues: &mut Queues) -> usize {
        let mut count = 0;
        while let Some(dispatched) = queues.next_task() {
            dispatched.task.run();
            queues.finish(dispatched.ticket);
            count += 1;
        }
        count
    }

    #[test]
    fn sequential_jobs_one_at_a_time() {
        let mut queues = Queues::default();
        let id = queues.start_stroke(strategy());
        queues.add_job(id, StrokeJob::sequential(|| ()));
        queues.add_job(id, StrokeJob::sequential(|| ()));

        // Init is a barrier.
        let init = queues.next_task().unwrap();
        assert!(queues.next_task().is_none());
        queues.finish(init.ticket);

        let first = queues.next_task().unwrap();
        assert!(queues.next_task().is_none());
        queues.finish(first.ticket);
        let second = queues.next_task().unwrap();
        queues.finish(second.ticket);
        assert!(!queues.has_queued());
        // Open, so not idle, but drained.
        assert!(queues.is_drained());
        assert!(!queues.is_idle());

        queues.end_stroke(id);
        assert_eq!(run_serially(&mut queues), 1);
        assert!(queues.is_idle());
    }
    #[test]
    fn concurrent_jobs_overlap_but_not_barriers() {
        let mut queues = Queues::default();
        let id = queues.start_stroke(strategy());
        let init = queues.next_task().unwrap();
        queues.finish(init.ticket);

        queues.add_job(id, StrokeJob::concurrent(|| ()));
        queues.add_job(id, StrokeJob::concurrent(|| ()));
        queues.add_job(id, StrokeJob::barrier(|| ()));
        let a = queues.next_task().unwrap();
        let b = queues.next_task().unwrap();
        assert_eq!(queues.running(), 2);
        // Barrier waits for both.
        assert!(queues.next_task().is_none());
        queues.finish(a.ticket);
        assert!(queues.next_task().is_none());
        queues.finish(b.ticket);
        let barrier = queues.next_task().unwrap();
        queues.add_job(id, StrokeJob::concurrent(|| ()));
        assert!(queues.next_task().is_none());
        queues.finish(barrier.ticket);
        assert!(queues.next_task().is_some());
    }
    #[test]
    fn exclusive_background_goes_alone() {
        let mut queues = Queues::default();
        let id = queues.start_stroke(strategy());
        let init = queues.next_task().unwrap();
        queues.finish(init.ticket);
        queues.add_job(id, StrokeJob::concurrent(|| ()));
        queues.add_job(id, StrokeJob::concurrent(|| ()));

        let running = queues.next_task().unwrap();
        queues.add_background_job(Box::new(Tagged {
            tag: 0,
            exclusive: true,
        }));
        // Stroke job is held back while the exclusive job waits.
        assert!(queues.next_task().is_none());
        queues.finish(running.ticket);
        let exclusive = queues.next_task().unwrap();
        assert!(queues.next_task().is_none());
        queues.finish(exclusive.ticket);
        assert!(queues.next_task().is_some());
    }
    #[test]
    fn exclusive_background_not_starved_behind_normal() {
        let mut queues = Queues::default();
        let id = queues.start_stroke(strategy());
        let init = queues.next_task().unwrap();
        queues.finish(init.ticket);
        queues.add_job(id, StrokeJob::concurrent(|| ()));
        queues.add_job(id, StrokeJob::concurrent(|| ()));
        let running = queues.next_task().unwrap();

        queues.add_background_job(Box::new(Tagged {
            tag: 1,
            exclusive: false,
        }));
        queues.add_background_job(Box::new(Tagged {
            tag: 2,
            exclusive: true,
        }));
        // Waiting for its window, not behind the normal job.
        assert!(queues.next_task().is_none());
        queues.finish(running.ticket);
        let exclusive = queues.next_task().unwrap();
        assert_eq!(background_tag(&exclusive), Some(2));
        assert!(queues.next_task().is_none());
        queues.finish(exclusive.ticket);

        // Stroke work still goes before the normal job.
        let stroke_job = queues.next_task().unwrap();
        assert_eq!(background_tag(&stroke_job), None);
        queues.finish(stroke_job.ticket);
        let normal = queues.next_task().unwrap();
        assert_eq!(background_tag(&normal), Some(1));
        queues.finish(normal.ticket);
        assert_eq!(queues.background_len(), 0);
    }
    #[test]
    fn merged_background_job_keeps_its_place() {
        let mut queues = Queues::default();
        for tag in [1, 2, 1, 3, 1] {
            queues.add_background_job(Box::new(Tagged {
                tag,
                exclusive: false,
            }));
        }
        let mut order = Vec::new();
        while let Some(next) = queues.next_task() {
            order.extend(background_tag(&next));
            queues.finish(next.ticket);
        }
        assert_eq!(order, [1, 2, 3]);
    }
    #[test]
    fn background_merges() {
        let mut queues = Queues::default();
        for _ in 0..3 {
            queues.add_background_job(Box::new(Tagged {
                tag: 1,
                exclusive: false,
            }));
        }
        queues.add_background_job(Box::new(Tagged {
            tag: 2,
            exclusive: false,
        }));
        assert_eq!(queues.background_len(), 2);
    }
    #[test]
    fn strokes_in_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut queues = Queues::default();
        let a = queues.start_stroke(strategy());
        let b = queues.start_stroke(strategy());
        for (id, tag) in [(b, 'b'), (a, 'a')] {
            let log = log.clone();
            queues.add_job(id, StrokeJob::sequential(move || log.lock().push(tag)));
        }
        // `a` still open, `b` can't start.
        run_serially(&mut queues);
        assert_eq!(log.lock().as_slice(), &['a']);
        queues.end_stroke(a);
        queues.end_stroke(b);
        run_serially(&mut queues);
        assert_eq!(log.lock().as_slice(), &['a', 'b']);
        assert!(queues.is_idle());
    }
    #[test]
    fn cancel_before_start_is_silent() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let mut queues = Queues::default();
        let id = {
            let cancelled = cancelled.clone();
            queues.start_stroke(Arc::new(SimpleStrokeStrategy::new("test").on_cancel(
                move || {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                },
            )))
        };
        assert!(queues.cancel_stroke(id));
        assert!(!queues.cancel_stroke(id));
        assert_eq!(run_serially(&mut queues), 0);
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
        assert!(queues.is_idle());
        // Unknown by now, still harmless.
        queues.add_job(id, StrokeJob::sequential(|| ()));
        assert!(!queues.has_queued());
    }
    #[test]
    fn cancel_after_start_runs_cleanup() {
        let ran = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));
        let mut queues = Queues::default();
        let id = {
            let cancelled = cancelled.clone();
            queues.start_stroke(Arc::new(SimpleStrokeStrategy::new("test").on_cancel(
                move || {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                },
            )))
        };
        run_serially(&mut queues);
        {
            let ran = ran.clone();
            queues.add_job(id, StrokeJob::sequential(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(queues.cancel_stroke(id));
        // Cancelled jobs are gone, later ones are ignored.
        queues.add_job(id, StrokeJob::sequential(|| ()));
        assert_eq!(run_serially(&mut queues), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(queues.is_idle());
    }
    #[test]
    fn async_cancel_needs_ended_strokes() {
        let mut queues = Queues::default();
        assert!(!queues.try_cancel_current());
        let id = queues.start_stroke(strategy());
        assert!(!queues.try_cancel_current());
        queues.end_stroke(id);
        assert!(queues.try_cancel_current());
        run_serially(&mut queues);
        assert!(queues.is_idle());
    }
    #[test]
    fn forgettable_strokes_dropped_by_newcomers() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut queues = Queues::default();
        let forgettable = {
            let finished = finished.clone();
            SimpleStrokeStrategy::new("preview")
                .with_flags(StrokeFlags::CAN_FORGET_ABOUT_ME)
                .on_finish(move || {
                    finished.fetch_add(1, Ordering::SeqCst);
                })
        };
        let old = queues.start_stroke(Arc::new(forgettable));
        queues.end_stroke(old);
        queues.start_stroke(strategy());
        assert_eq!(queues.stroke_count(), 1);
        run_serially(&mut queues);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
    #[test]
    fn locked_halts_dispatch() {
        let mut queues = Queues::default();
        queues.add_background_job(Box::new(Tagged {
            tag: 0,
            exclusive: false,
        }));
        queues.locked = true;
        assert!(queues.next_task().is_none());
        assert!(queues.is_drained());
        assert!(queues.has_queued());
        queues.locked = false;
        assert!(!queues.is_drained());
        assert_eq!(run_serially(&mut queues), 1);
    }
}
