//! Time source and run-scoped cancellation
//!
//! Every wait in the engine (backoff, readiness polling) goes through a
//! [`Clock`] so tests can advance time without sleeping.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Granularity of cancellable sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Source of time for the engine
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;

    /// Block the calling thread for `duration`
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `std::thread::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock that only moves when slept on
///
/// Used by tests and simulations; `sleep` returns immediately after
/// advancing the clock.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward without sleeping
    pub fn advance(&self, duration: Duration) {
        let mut offset = match self.offset.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *offset += duration;
    }

    /// Total time elapsed since creation
    pub fn elapsed(&self) -> Duration {
        match self.offset.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Run-scoped cancellation flag
///
/// Cloning shares the flag. Once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` in small slices, waking early on cancellation.
    ///
    /// Returns `false` if the token was cancelled before the full duration
    /// elapsed.
    /// A duration past the clock's range sleeps until cancelled.
    pub fn sleep(&self, clock: &dyn Clock, duration: Duration) -> bool {
        let deadline = clock.now().checked_add(duration);
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = clock.now();
            let slice = match deadline {
                Some(deadline) if now >= deadline => return true,
                Some(deadline) => (deadline - now).min(SLEEP_SLICE),
                None => SLEEP_SLICE,
            };
            clock.sleep(slice);
        }
    }
}
