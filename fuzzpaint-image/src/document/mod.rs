//! # Document
//!
//! The concurrency face of an open image. Every mutation goes through here as a stroke of jobs, run by the
//! [`Scheduler`]. The owning thread may lock the whole image, wait for work to finish, or suppress updates, and
//! the document keeps those requests consistent with whatever the workers are doing.
//!
//! Locking nests. Only the outermost `lock`/`unlock` pair touches the scheduler:
//! ```text
//!  Unlocked ──lock/barrier_lock──► Locked(depth 1) ──lock──► Locked(depth 2) ...
//!      ▲                                 │
//!      └────────────unlock───────────────┘
//! ```
//! A lock is read-only only if *every* nested request asked for read-only. Releasing a writing lock
//! invalidates level-of-detail data, as the image may have changed underneath it.

pub mod filters;

use std::sync::{Arc, Weak};

use crate::jobs::{BackgroundJob, ProjectionUpdate, StrokeJob, TimingProbe};
use crate::scheduler::{LodPreferences, Scheduler, SchedulerError, ThreadPoolScheduler};
use crate::stroke::{StrokeID, StrokeStrategy};
use crate::util::Rect;
use crate::wait_broker::{WaitBroker, WaitGuard, WaitSubject};
use filters::{
    DropAllUpdatesFilter, FilterCookie, FilterStack, ProjectionUpdatesFilter, UiUpdateGate,
};

pub struct DocumentMarker;
pub type DocumentID = crate::FuzzID<DocumentMarker>;

/// Notifications to whoever drives the document. Obtained through [`Document::listen`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DocumentMessage {
    /// Open strokes should wrap up. They're free to ignore it.
    StrokeEndRequested,
    /// The running stroke could not be cancelled directly, its creator should do it.
    StrokeCancellationRequested,
    UndoDuringStrokeRequested,
    RedoDuringStrokeRequested,
    /// This area of the projection changed, in full-resolution pixels.
    Updated(Rect),
}

/// The undo history, as far as concurrency is concerned.
pub trait UndoStore: Send + Sync + 'static {
    fn purge_redo_state(&self);
}

#[derive(Default)]
struct LockState {
    depth: usize,
    read_only: bool,
}

struct Inner {
    id: DocumentID,
    scheduler: Arc<dyn Scheduler>,
    undo: Option<Arc<dyn UndoStore>>,
    broker: Option<Arc<WaitBroker>>,
    /// Held across a whole lock or unlock transition, including the wait. Never touched by workers.
    transition: parking_lot::Mutex<()>,
    lock: parking_lot::Mutex<LockState>,
    filters: parking_lot::Mutex<FilterStack>,
    dirty_cookies: parking_lot::Mutex<Vec<FilterCookie>>,
    ui_updates: UiUpdateGate,
    // Bus blocks on full, so `try_broadcast` is used throughout.
    messages: parking_lot::Mutex<bus::Bus<DocumentMessage>>,
}
impl Inner {
    fn broadcast(&self, message: DocumentMessage) {
        if let Err(message) = self.messages.lock().try_broadcast(message) {
            log::warn!("{} listener is full, dropped {message:?}", self.id);
        }
    }
    fn wait_guard(&self, alive: bool) -> WaitGuard<'_> {
        WaitGuard::new(
            self.broker.as_deref(),
            WaitSubject {
                document: self.id,
                alive,
            },
        )
    }
}
impl Drop for Inner {
    fn drop(&mut self) {
        if self.scheduler.is_worker_thread() {
            // Waiting would mean waiting on ourselves.
            log::warn!("{} dropped from a worker, outstanding work not awaited", self.id);
            return;
        }
        if self.lock.get_mut().depth != 0 {
            log::warn!("{} dropped while locked", self.id);
        }
        self.broadcast(DocumentMessage::StrokeEndRequested);
        let _wait = self.wait_guard(false);
        self.scheduler.wait_for_done();
    }
}

/// Shared handle to a document. Cloning is cheap, the last handle dropped waits for outstanding work.
#[derive(Clone)]
pub struct Document {
    inner: Arc<Inner>,
}

/// A handle that doesn't keep the document alive.
#[derive(Clone, Default)]
pub struct WeakDocument {
    inner: Weak<Inner>,
}
impl WeakDocument {
    /// A handle to no document at all.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    #[must_use]
    pub fn upgrade(&self) -> Option<Document> {
        self.inner.upgrade().map(|inner| Document { inner })
    }
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.inner.ptr_eq(&other.inner)
    }
}

pub struct DocumentBuilder {
    scheduler: Arc<dyn Scheduler>,
    undo: Option<Arc<dyn UndoStore>>,
    broker: Option<Arc<WaitBroker>>,
    message_capacity: usize,
}
impl DocumentBuilder {
    #[must_use]
    pub fn undo_store(mut self, undo: Arc<dyn UndoStore>) -> Self {
        self.undo = Some(undo);
        self
    }
    /// Defaults to the process-wide [`WaitBroker::instance`], if any.
    #[must_use]
    pub fn wait_broker(mut self, broker: Option<Arc<WaitBroker>>) -> Self {
        self.broker = broker;
        self
    }
    #[must_use]
    pub fn message_capacity(mut self, capacity: usize) -> Self {
        self.message_capacity = capacity;
        self
    }
    #[must_use]
    pub fn build(self) -> Document {
        let id = DocumentID::next();
        log::debug!("{id} created");
        Document {
            inner: Arc::new(Inner {
                id,
                scheduler: self.scheduler,
                undo: self.undo,
                broker: self.broker,
                transition: parking_lot::Mutex::new(()),
                lock: parking_lot::Mutex::default(),
                filters: parking_lot::Mutex::default(),
                dirty_cookies: parking_lot::Mutex::default(),
                ui_updates: UiUpdateGate::default(),
                messages: bus::Bus::new(self.message_capacity.max(1)).into(),
            }),
        }
    }
}

/// Holds a barrier lock on the document for its lifetime.
pub struct BarrierLockGuard<'a> {
    document: &'a Document,
}
impl Drop for BarrierLockGuard<'_> {
    fn drop(&mut self) {
        self.document.unlock();
    }
}

impl Document {
    #[must_use]
    pub fn builder(scheduler: Arc<dyn Scheduler>) -> DocumentBuilder {
        DocumentBuilder {
            scheduler,
            undo: None,
            broker: WaitBroker::instance(),
            message_capacity: crate::config::ImageConfig::default().message_capacity,
        }
    }
    /// A document on its own [`ThreadPoolScheduler`], set up from `config`.
    pub fn from_config(config: &crate::config::ImageConfig) -> Result<Self, SchedulerError> {
        let scheduler = ThreadPoolScheduler::from_config(config)?;
        Ok(Self::builder(Arc::new(scheduler))
            .message_capacity(config.message_capacity)
            .build())
    }
    #[must_use]
    pub fn id(&self) -> DocumentID {
        self.inner.id
    }
    #[must_use]
    pub fn downgrade(&self) -> WeakDocument {
        WeakDocument {
            inner: Arc::downgrade(&self.inner),
        }
    }
    /// Receive notifications from now on.
    pub fn listen(&self) -> bus::BusReader<DocumentMessage> {
        self.inner.messages.lock().add_rx()
    }

    // ====== Locking ======

    /// Emergency lock: halts the workers and waits only for *running* jobs. Queued jobs stay queued.
    /// Prefer [`Document::barrier_lock`].
    pub fn lock(&self) {
        let _transition = self.inner.transition.lock();
        if !self.locked() {
            self.request_stroke_end();
            let _wait = self.inner.wait_guard(true);
            self.inner.scheduler.lock();
        }
        let mut state = self.inner.lock.lock();
        state.depth += 1;
        state.read_only = false;
    }
    /// Read-only counterpart of [`Document::lock`].
    pub fn immediate_lock_for_read_only(&self) {
        let _transition = self.inner.transition.lock();
        let was_locked = self.locked();
        if !was_locked {
            self.request_stroke_end();
            let _wait = self.inner.wait_guard(true);
            self.inner.scheduler.immediate_lock_for_read_only();
        }
        let mut state = self.inner.lock.lock();
        if !was_locked {
            state.read_only = true;
        }
        state.depth += 1;
    }
    /// Wait for everything queued to finish, then lock.
    /// Nested calls don't wait again, and narrow `read_only` to the AND of all requests.
    pub fn barrier_lock(&self, read_only: bool) {
        let _transition = self.inner.transition.lock();
        let was_locked = self.locked();
        if !was_locked {
            self.request_stroke_end();
            let _wait = self.inner.wait_guard(true);
            self.inner.scheduler.barrier_lock();
        }
        let mut state = self.inner.lock.lock();
        if was_locked {
            state.read_only &= read_only;
        } else {
            state.read_only = read_only;
        }
        state.depth += 1;
    }
    /// [`Document::barrier_lock`] if that wouldn't block. Returns false with nothing changed otherwise.
    pub fn try_barrier_lock(&self, read_only: bool) -> bool {
        // Another thread mid-transition counts as contention.
        let Some(_transition) = self.inner.transition.try_lock() else {
            return false;
        };
        let was_locked = self.locked();
        if !was_locked && !self.inner.scheduler.try_barrier_lock() {
            return false;
        }
        let mut state = self.inner.lock.lock();
        if was_locked {
            state.read_only &= read_only;
        } else {
            state.read_only = read_only;
        }
        state.depth += 1;
        true
    }
    /// Lock with [`Document::barrier_lock`], unlocking when the guard is dropped.
    #[must_use = "the lock is released as soon as the guard is dropped"]
    pub fn barrier_lock_guard(&self, read_only: bool) -> BarrierLockGuard<'_> {
        self.barrier_lock(read_only);
        BarrierLockGuard { document: self }
    }
    /// # Panics
    /// If the document isn't locked.
    pub fn unlock(&self) {
        let _transition = self.inner.transition.lock();
        let mut state = self.inner.lock.lock();
        assert!(state.depth != 0, "{} unlocked without a lock", self.inner.id);
        state.depth -= 1;
        if state.depth == 0 {
            let read_only = state.read_only;
            drop(state);
            self.inner.scheduler.unlock(!read_only);
        }
    }
    #[must_use]
    pub fn locked(&self) -> bool {
        self.inner.lock.lock().depth != 0
    }
    /// Whether the current lock is read-only. Meaningless while unlocked.
    #[must_use]
    pub fn is_locked_read_only(&self) -> bool {
        self.inner.lock.lock().read_only
    }
    #[must_use]
    pub fn is_idle(&self, allow_locked: bool) -> bool {
        (allow_locked || !self.locked()) && self.inner.scheduler.is_idle()
    }
    /// Ask open strokes to end, then block until every queued job has run.
    pub fn wait_for_done(&self) {
        self.request_stroke_end();
        let _wait = self.inner.wait_guard(true);
        self.inner.scheduler.wait_for_done();
    }

    // ====== Strokes ======

    pub fn start_stroke(&self, strategy: Arc<dyn StrokeStrategy>) -> StrokeID {
        if strategy.requests_other_strokes_to_end() {
            self.request_stroke_end();
        }
        // Eagerly, the stroke may invalidate redo states before it records anything of its own.
        if strategy.clears_redo_on_start() {
            if let Some(undo) = &self.inner.undo {
                undo.purge_redo_state();
            }
        }
        self.inner.scheduler.start_stroke(strategy)
    }
    pub fn add_job(&self, stroke: StrokeID, job: StrokeJob) {
        let job = TimingProbe::new(stroke.to_string()).instrument(job);
        self.inner.scheduler.add_job(stroke, job);
    }
    pub fn end_stroke(&self, stroke: StrokeID) {
        self.inner.scheduler.end_stroke(stroke);
    }
    /// Returns true if this call cancelled the stroke.
    pub fn cancel_stroke(&self, stroke: StrokeID) -> bool {
        self.inner.scheduler.cancel_stroke(stroke)
    }
    /// Cancel the current stroke directly if possible, otherwise ask its creator to.
    pub fn request_stroke_cancellation(&self) {
        if !self.inner.scheduler.try_cancel_current_stroke_async() {
            self.inner
                .broadcast(DocumentMessage::StrokeCancellationRequested);
        }
    }
    pub fn request_stroke_end(&self) {
        self.inner.broadcast(DocumentMessage::StrokeEndRequested);
    }
    pub fn request_undo_during_stroke(&self) {
        self.inner
            .broadcast(DocumentMessage::UndoDuringStrokeRequested);
    }
    pub fn request_redo_during_stroke(&self) {
        self.inner
            .broadcast(DocumentMessage::RedoDuringStrokeRequested);
    }
    /// Queue work outside of any stroke.
    pub fn add_spontaneous_job(&self, job: Box<dyn BackgroundJob>) {
        self.inner.scheduler.add_background_job(job);
    }

    // ====== Projection updates ======

    /// Install a filter on top of the stack. Remove it with the returned cookie, in reverse install order.
    pub fn add_projection_updates_filter(
        &self,
        filter: Arc<dyn ProjectionUpdatesFilter>,
    ) -> FilterCookie {
        self.inner.filters.lock().push(filter)
    }
    /// # Panics
    /// If `cookie` isn't the most recently installed filter.
    pub fn remove_projection_updates_filter(
        &self,
        cookie: FilterCookie,
    ) -> Arc<dyn ProjectionUpdatesFilter> {
        self.inner.filters.lock().pop(cookie)
    }
    #[must_use]
    pub fn current_projection_updates_filter(&self) -> Option<FilterCookie> {
        self.inner.filters.lock().top()
    }
    /// Drop all update requests until the matching [`Document::enable_dirty_requests`].
    pub fn disable_dirty_requests(&self) {
        let cookie = self.add_projection_updates_filter(Arc::new(DropAllUpdatesFilter));
        self.inner.dirty_cookies.lock().push(cookie);
    }
    /// # Panics
    /// If dirty requests weren't disabled, or another filter was installed on top in the meantime.
    pub fn enable_dirty_requests(&self) {
        let cookie = self.inner.dirty_cookies.lock().pop();
        let Some(cookie) = cookie else {
            panic!("{} dirty requests enabled without being disabled", self.inner.id);
        };
        self.remove_projection_updates_filter(cookie);
    }
    /// Postpone [`DocumentMessage::Updated`] until the matching [`Document::enable_ui_updates`].
    pub fn disable_ui_updates(&self) {
        self.inner.ui_updates.disable();
    }
    /// Returns the updates postponed so far, for the caller to apply as it sees fit.
    ///
    /// # Panics
    /// If UI updates weren't disabled.
    pub fn enable_ui_updates(&self) -> Vec<Rect> {
        self.inner.ui_updates.enable()
    }
    /// Ask for an area of the projection to be brought up to date.
    /// Returns false if a filter swallowed the request.
    pub fn request_projection_update(&self, rects: &[Rect]) -> bool {
        let filters = self.inner.filters.lock().innermost_first();
        if filters
            .iter()
            .any(|filter| filter.filter(self.inner.id, rects))
        {
            return false;
        }
        self.add_spontaneous_job(Box::new(ProjectionUpdate::new(self.downgrade(), rects)));
        true
    }
    /// An area of the projection changed. `rect` is in current level-of-detail pixels.
    pub fn notify_projection_updated(&self, rect: Rect) {
        let Some(rect) = self.inner.ui_updates.pass_or_postpone(rect) else {
            return;
        };
        let rect = match self.current_level_of_detail() {
            0 => rect,
            lod => rect.upscaled(lod),
        };
        if !rect.is_empty() {
            self.inner.broadcast(DocumentMessage::Updated(rect));
        }
    }

    // ====== Level of detail ======

    #[must_use]
    pub fn current_level_of_detail(&self) -> u8 {
        self.inner.scheduler.current_level_of_detail()
    }
    #[must_use]
    pub fn lod_preferences(&self) -> LodPreferences {
        self.inner.scheduler.lod_preferences()
    }
    pub fn set_lod_preferences(&self, preferences: LodPreferences) {
        self.inner.scheduler.set_lod_preferences(preferences);
    }
    /// Regenerate reduced-detail data, if it's both supported and wanted. Expensive!
    pub fn explicit_regenerate_level_of_detail(&self) {
        if self.lod_preferences().lod_enabled() {
            self.inner.scheduler.explicit_regenerate_level_of_detail();
        }
    }
}
