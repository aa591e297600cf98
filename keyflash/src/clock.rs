//! Time source used by the countdown and device polling.
//!
//! Production code uses [`SystemClock`]. [`SimulatedClock`] advances virtual
//! time instantly, so countdown timing can be asserted without waiting.

use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// A monotonic clock that can also block.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Real wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Virtual clock: `sleep` returns immediately and moves time forward.
#[derive(Debug)]
pub struct SimulatedClock {
    origin: Instant,
    inner: Mutex<SimulatedState>,
}

#[derive(Debug, Default)]
struct SimulatedState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl SimulatedClock {
    /// Create a clock starting at the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            inner: Mutex::new(SimulatedState::default()),
        }
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }

    /// Move time forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        self.lock().elapsed += duration;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Instant {
        self.origin + self.lock().elapsed
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.lock();
        state.elapsed += duration;
        state.sleeps.push(duration);
        drop(state);
        // Let other threads observe progress between virtual ticks
        thread::yield_now();
    }
}
