//! A fixed pool of named worker threads sharing one set of [`Queues`].

use std::sync::Arc;

use super::queue::Queues;
use super::{LodPreferences, Scheduler, SchedulerError};
use crate::jobs::{BackgroundJob, Exclusivity, StrokeJob};
use crate::stroke::{StrokeID, StrokeStrategy};

struct LodState {
    preferences: LodPreferences,
    /// Reduced-detail data is up to date with the image.
    cache_valid: bool,
}

struct Shared {
    queues: parking_lot::Mutex<Queues>,
    /// Signalled when there may be something new to dispatch.
    work_ready: parking_lot::Condvar,
    /// Signalled whenever a task finishes.
    progress: parking_lot::Condvar,
    shutdown: std::sync::atomic::AtomicBool,
    lod: parking_lot::Mutex<LodState>,
}
impl Shared {
    fn worker(&self) {
        let mut queues = self.queues.lock();
        loop {
            if self.shutdown.load(std::sync::atomic::Ordering::Acquire) {
                return;
            }
            let Some(dispatched) = queues.next_task() else {
                self.work_ready.wait(&mut queues);
                continue;
            };
            parking_lot::MutexGuard::unlocked(&mut queues, || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    dispatched.task.run();
                }));
                if let Err(e) = result {
                    let message = e
                        .downcast_ref::<&str>()
                        .copied()
                        .or_else(|| e.downcast_ref::<String>().map(String::as_str))
                        .unwrap_or("<unknown>");
                    log::error!("Job panicked: {message}");
                }
            });
            queues.finish(dispatched.ticket);
            self.progress.notify_all();
            // Finishing may have unblocked barriers or exclusive jobs.
            self.work_ready.notify_all();
        }
    }
    fn wait_until(&self, mut done: impl FnMut(&Queues) -> bool) -> parking_lot::MutexGuard<'_, Queues> {
        let mut queues = self.queues.lock();
        while !done(&queues) {
            self.progress.wait(&mut queues);
        }
        queues
    }
}

/// Brings reduced-detail data up to date. Exclusive, the image must hold still while it's read.
struct RegenerateLod {
    shared: std::sync::Weak<Shared>,
}
impl BackgroundJob for RegenerateLod {
    fn name(&self) -> &'static str {
        "regenerate-lod"
    }
    fn exclusivity(&self) -> Exclusivity {
        Exclusivity::Exclusive
    }
    fn overrides(&mut self, older: &dyn BackgroundJob) -> bool {
        older.as_any().is::<Self>()
    }
    fn run(self: Box<Self>) {
        if let Some(shared) = self.shared.upgrade() {
            let mut lod = shared.lod.lock();
            log::debug!("Regenerating LOD{}", lod.preferences.desired_level);
            lod.cache_valid = true;
        }
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct ThreadPoolScheduler {
    shared: Arc<Shared>,
    workers: Vec<std::thread::JoinHandle<()>>,
    worker_ids: hashbrown::HashSet<std::thread::ThreadId>,
}
impl ThreadPoolScheduler {
    /// Spawn `workers` threads. Fails if that's zero or the OS refuses.
    pub fn new(workers: usize, lod: LodPreferences) -> Result<Self, SchedulerError> {
        if workers == 0 {
            return Err(SchedulerError::ZeroWorkers);
        }
        let shared = Arc::new(Shared {
            queues: parking_lot::Mutex::default(),
            work_ready: parking_lot::Condvar::new(),
            progress: parking_lot::Condvar::new(),
            shutdown: false.into(),
            lod: parking_lot::Mutex::new(LodState {
                preferences: lod,
                cache_valid: false,
            }),
        });
        let mut this = Self {
            shared,
            workers: Vec::with_capacity(workers),
            worker_ids: hashbrown::HashSet::with_capacity(workers),
        };
        for idx in 0..workers {
            let shared = this.shared.clone();
            // On error, `this` is dropped and the already-spawned workers are shut down.
            let handle = std::thread::Builder::new()
                .name(format!("fuzzpaint-image-worker-{idx}"))
                .spawn(move || shared.worker())?;
            this.worker_ids.insert(handle.thread().id());
            this.workers.push(handle);
        }
        log::info!("Started {workers} image workers");
        Ok(this)
    }
    /// Pool sized and configured from [`ImageConfig`](crate::config::ImageConfig).
    pub fn from_config(config: &crate::config::ImageConfig) -> Result<Self, SchedulerError> {
        Self::new(config.effective_worker_threads(), config.lod.into())
    }
    /// Run `f` on the queues, then wake the workers.
    fn with_queues<R>(&self, f: impl FnOnce(&mut Queues) -> R) -> R {
        let result = f(&mut self.shared.queues.lock());
        self.shared.work_ready.notify_all();
        result
    }
}
impl Scheduler for ThreadPoolScheduler {
    fn start_stroke(&self, strategy: Arc<dyn StrokeStrategy>) -> StrokeID {
        let name = strategy.name().to_owned();
        let id = self.with_queues(|queues| queues.start_stroke(strategy));
        log::trace!("{id} \"{name}\" started");
        id
    }
    fn add_job(&self, stroke: StrokeID, job: StrokeJob) {
        self.with_queues(|queues| queues.add_job(stroke, job));
    }
    fn end_stroke(&self, stroke: StrokeID) {
        self.with_queues(|queues| queues.end_stroke(stroke));
    }
    fn cancel_stroke(&self, stroke: StrokeID) -> bool {
        let cancelled = self.with_queues(|queues| queues.cancel_stroke(stroke));
        // Pruning may have settled things without any task running.
        self.shared.progress.notify_all();
        cancelled
    }
    fn try_cancel_current_stroke_async(&self) -> bool {
        let cancelled = self.with_queues(Queues::try_cancel_current);
        self.shared.progress.notify_all();
        cancelled
    }
    fn add_background_job(&self, job: Box<dyn BackgroundJob>) {
        self.with_queues(|queues| queues.add_background_job(job));
    }
    fn lock(&self) {
        self.shared.queues.lock().locked = true;
        drop(self.shared.wait_until(|queues| queues.running() == 0));
    }
    fn immediate_lock_for_read_only(&self) {
        // Nothing special to do for read-only access, the workers are what must be stopped.
        self.lock();
    }
    fn barrier_lock(&self) {
        let mut queues = self.shared.wait_until(Queues::is_drained);
        queues.locked = true;
    }
    fn try_barrier_lock(&self) -> bool {
        let mut queues = self.shared.queues.lock();
        if queues.running() != 0 || queues.has_queued() {
            return false;
        }
        queues.locked = true;
        true
    }
    fn unlock(&self, reset_lod: bool) {
        if reset_lod {
            self.shared.lod.lock().cache_valid = false;
        }
        self.with_queues(|queues| queues.locked = false);
    }
    fn is_idle(&self) -> bool {
        self.shared.queues.lock().is_idle()
    }
    fn wait_for_done(&self) {
        drop(self.shared.wait_until(Queues::is_drained));
    }
    fn current_level_of_detail(&self) -> u8 {
        let lod = self.shared.lod.lock();
        if lod.cache_valid && lod.preferences.lod_enabled() {
            lod.preferences.desired_level
        } else {
            0
        }
    }
    fn lod_preferences(&self) -> LodPreferences {
        self.shared.lod.lock().preferences
    }
    fn set_lod_preferences(&self, preferences: LodPreferences) {
        let mut lod = self.shared.lod.lock();
        if lod.preferences.desired_level != preferences.desired_level {
            lod.cache_valid = false;
        }
        lod.preferences = preferences;
    }
    fn explicit_regenerate_level_of_detail(&self) {
        self.add_background_job(Box::new(RegenerateLod {
            shared: Arc::downgrade(&self.shared),
        }));
    }
    fn is_worker_thread(&self) -> bool {
        self.worker_ids.contains(&std::thread::current().id())
    }
}
impl Drop for ThreadPoolScheduler {
    fn drop(&mut self) {
        {
            let queues = self.shared.queues.lock();
            if queues.has_queued() || queues.running() != 0 {
                log::warn!("Image scheduler dropped with work outstanding, it will be discarded");
            }
            self.shared
                .shutdown
                .store(true, std::sync::atomic::Ordering::Release);
        }
        self.shared.work_ready.notify_all();
        let current = std::thread::current().id();
        for worker in self.workers.drain(..) {
            // Dropped from within a job - can't wait for ourselves, that worker exits once the job returns.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                log::error!("Image worker panicked outside of a job");
            }
        }
    }
}
