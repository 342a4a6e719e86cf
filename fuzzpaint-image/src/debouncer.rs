//! # Cross-thread debouncer
//!
//! Coalesces bursts of "please fire later" requests, from any thread, into a single callback on the owner thread.
//! The timer state belongs to the owner - calls from elsewhere are posted to the [`OwnerLoop`](crate::owner_loop::OwnerLoop)
//! and applied there, in order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::owner_loop::{LoopHandle, LoopTimer};

/// Which request in a burst sets the deadline.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Coalesce {
    /// Fire `delay` after the first request of a burst. Later requests ride along.
    #[default]
    FromFirst,
    /// Every request pushes the deadline back, firing `delay` after the burst goes quiet.
    FromLast,
}

struct TimerState {
    delay: Duration,
    deadline: Option<Instant>,
}

struct Timer {
    coalesce: Coalesce,
    state: parking_lot::Mutex<TimerState>,
    fire: Box<dyn Fn() + Send + Sync>,
}
impl Timer {
    fn start(&self) {
        let mut state = self.state.lock();
        let deadline = Instant::now() + state.delay;
        state.deadline = match (self.coalesce, state.deadline) {
            (Coalesce::FromFirst, Some(existing)) => Some(existing),
            _ => Some(deadline),
        };
    }
    fn stop(&self) {
        self.state.lock().deadline = None;
    }
    fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }
}
impl LoopTimer for Timer {
    fn deadline(&self) -> Option<Instant> {
        self.state.lock().deadline
    }
    fn expire(&self, now: Instant) {
        {
            let mut state = self.state.lock();
            match state.deadline {
                Some(deadline) if deadline <= now => state.deadline = None,
                // Restarted or stopped since the loop looked.
                _ => return,
            }
        }
        // Unlocked - the callback may well start us again.
        (self.fire)();
    }
}

pub struct CrossThreadDebouncer {
    timer: Arc<Timer>,
    owner: LoopHandle,
}
impl CrossThreadDebouncer {
    /// Create a debouncer serviced by `owner`. `fire` is always called on the owner thread,
    /// exactly once per settled burst.
    pub fn new(
        owner: &LoopHandle,
        delay: Duration,
        coalesce: Coalesce,
        fire: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let timer = Arc::new(Timer {
            coalesce,
            state: parking_lot::Mutex::new(TimerState {
                delay,
                deadline: None,
            }),
            fire: Box::new(fire),
        });
        let weak = Arc::downgrade(&timer);
        owner.register_timer(weak);
        Self {
            timer,
            owner: owner.clone(),
        }
    }
    /// Apply `op` to the timer on the owner thread - immediately if we're already there.
    fn on_owner(&self, op: impl FnOnce(&Timer) + Send + 'static) {
        if self.owner.is_owner_thread() {
            op(&self.timer);
        } else {
            let timer = self.timer.clone();
            self.owner.post(move || op(&timer));
        }
    }
    /// Request a firing after the configured delay.
    pub fn start(&self) {
        self.on_owner(Timer::start);
    }
    /// Cancel a pending firing, if any.
    pub fn stop(&self) {
        self.on_owner(Timer::stop);
    }
    /// Change the delay used by subsequent starts. A pending deadline is left as-is.
    pub fn set_delay(&self, delay: Duration) {
        self.on_owner(move |timer| timer.set_delay(delay));
    }
    /// Is a firing pending? Requests still in flight from other threads are not yet counted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.timer.state.lock().deadline.is_some()
    }
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.timer.state.lock().delay
    }
}
