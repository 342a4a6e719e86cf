//! # Owner loop
//!
//! The document's owning thread runs one of these. Any thread may [`LoopHandle::post`] work to it,
//! and it drives the timers of every [`crate::debouncer::CrossThreadDebouncer`] attached to it.
//! Timers are only ever read or modified from the owner thread - other threads marshal their requests
//! through the task channel instead.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send>;

/// Something with a deadline, serviced by the owner loop.
pub(crate) trait LoopTimer: Send + Sync {
    fn deadline(&self) -> Option<Instant>;
    /// Called on the owner thread at or after the deadline.
    fn expire(&self, now: Instant);
}

struct Shared {
    owner: std::thread::ThreadId,
    send: crossbeam::channel::Sender<Task>,
    recv: crossbeam::channel::Receiver<Task>,
    timers: parking_lot::Mutex<Vec<Weak<dyn LoopTimer>>>,
}

/// The run loop itself. Lives on (and is pinned to) the thread that created it.
pub struct OwnerLoop {
    shared: Arc<Shared>,
    // !Send - processing must happen on the owner.
    _pinned: std::marker::PhantomData<*const ()>,
}
impl Default for OwnerLoop {
    fn default() -> Self {
        Self::new()
    }
}
impl OwnerLoop {
    /// Create a loop owned by the calling thread.
    #[must_use]
    pub fn new() -> Self {
        let (send, recv) = crossbeam::channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                owner: std::thread::current().id(),
                send,
                recv,
                timers: parking_lot::Mutex::default(),
            }),
            _pinned: std::marker::PhantomData,
        }
    }
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }
    /// Run every task posted so far and fire every expired timer, without blocking.
    /// Returns the number of events handled.
    pub fn process_pending(&self) -> usize {
        let mut handled = 0;
        while let Ok(task) = self.shared.recv.try_recv() {
            task();
            handled += 1;
        }
        handled + self.fire_expired(Instant::now())
    }
    /// Wait up to `max_wait` for something to do, then do everything available.
    /// Returns the number of events handled, zero on timeout.
    pub fn process_events(&self, max_wait: Duration) -> usize {
        let handled = self.process_pending();
        if handled != 0 {
            return handled;
        }
        let now = Instant::now();
        let mut wait = max_wait;
        if let Some(deadline) = self.next_deadline() {
            wait = wait.min(deadline.saturating_duration_since(now));
        }
        match self.shared.recv.recv_timeout(wait) {
            Ok(task) => {
                task();
                1 + self.process_pending()
            }
            // Timed out, likely because a timer came due.
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => self.process_pending(),
            // We hold a sender ourselves, so this can't happen.
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => 0,
        }
    }
    /// Keep processing until `done` returns true, or `timeout` elapses.
    /// Returns the final value of `done`.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= end {
                return false;
            }
            // Poll in slices, `done` may depend on other threads rather than on us.
            self.process_events((end - now).min(Duration::from_millis(5)));
        }
    }
    fn live_timers(&self) -> Vec<Arc<dyn LoopTimer>> {
        let mut timers = self.shared.timers.lock();
        timers.retain(|timer| timer.strong_count() != 0);
        timers.iter().filter_map(Weak::upgrade).collect()
    }
    fn next_deadline(&self) -> Option<Instant> {
        self.live_timers()
            .iter()
            .filter_map(|timer| timer.deadline())
            .min()
    }
    fn fire_expired(&self, now: Instant) -> usize {
        // Timers list is not locked during `expire`, callbacks may freely start other timers.
        let mut fired = 0;
        for timer in self.live_timers() {
            if timer.deadline().is_some_and(|deadline| deadline <= now) {
                timer.expire(now);
                fired += 1;
            }
        }
        fired
    }
}

/// Cheap, sendable reference to an [`OwnerLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}
impl LoopHandle {
    #[must_use]
    pub fn owner(&self) -> std::thread::ThreadId {
        self.shared.owner
    }
    #[must_use]
    pub fn is_owner_thread(&self) -> bool {
        std::thread::current().id() == self.shared.owner
    }
    /// Queue `task` to run on the owner thread during its next processing pass.
    /// Tasks run in the order they were posted.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        // Can't fail, the shared state holds a receiver.
        let _ = self.shared.send.send(Box::new(task));
    }
    pub(crate) fn register_timer(&self, timer: Weak<dyn LoopTimer>) {
        self.shared.timers.lock().push(timer);
    }
}

#[cfg(test)]
mod test {
    use super::OwnerLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn posted_tasks_run_on_owner_in_order() {
        let owner = OwnerLoop::new();
        let handle = owner.handle();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let owner_id = std::thread::current().id();

        let worker = {
            let order = order.clone();
            std::thread::spawn(move || {
                assert!(!handle.is_owner_thread());
                for i in 0..3 {
                    let order = order.clone();
                    handle.post(move || {
                        assert_eq!(std::thread::current().id(), owner_id);
                        order.lock().push(i);
                    });
                }
            })
        };
        worker.join().unwrap();
        assert!(owner.run_until(Duration::from_secs(1), || order.lock().len() == 3));
        assert_eq!(*order.lock(), [0, 1, 2]);
    }
    #[test]
    fn times_out_quietly() {
        let owner = OwnerLoop::new();
        let counter = AtomicUsize::new(0);
        assert_eq!(owner.process_events(Duration::from_millis(1)), 0);
        assert!(!owner.run_until(Duration::from_millis(10), || {
            counter.fetch_add(1, Ordering::Relaxed);
            false
        }));
        assert!(counter.load(Ordering::Relaxed) > 1);
    }
}
