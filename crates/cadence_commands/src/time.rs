//! Time sources for the scheduler.
//!
//! Everything time-related in a scheduler (tick durations, command runtimes,
//! event timestamps, [`Coroutine::wait`](crate::coroutine::Coroutine::wait))
//! reads one shared [`Clock`]. Swapping its [`ClockProvider`] lets a test step
//! time by exactly one loop period per tick.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Instant;
//! use cadence_commands::scheduler::Scheduler;
//! use cadence_commands::time::ClockProvider;
//!
//! /// Time as reported by the robot controller.
//! struct ControllerClock(Instant);
//!
//! impl ClockProvider for ControllerClock {
//!     fn now(&self) -> Instant {
//!         self.0
//!     }
//! }
//!
//! let scheduler = Scheduler::builder()
//!     .with_clock(Arc::new(ControllerClock(Instant::now())))
//!     .build();
//! # let _ = scheduler;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of the current instant.
pub trait ClockProvider: Send + Sync + 'static {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Reads the operating system's monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl ClockProvider for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Clock
// ─────────────────────────────────────────────────────────────────────────────

/// Cheaply cloneable handle to a [`ClockProvider`].
#[derive(Clone)]
pub struct Clock {
    provider: Arc<dyn ClockProvider>,
}

impl Clock {
    /// Creates a clock backed by [`MonotonicClock`].
    #[must_use]
    pub fn system() -> Self {
        Self::with_provider(Arc::new(MonotonicClock))
    }

    /// Creates a clock that reads `provider`.
    #[must_use]
    pub fn with_provider(provider: Arc<dyn ClockProvider>) -> Self {
        Self { provider }
    }

    /// Returns the current instant.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.provider.now()
    }

    /// Returns the time since `earlier`, or zero if `earlier` has not
    /// happened yet.
    #[must_use]
    pub fn elapsed_since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }

    /// Starts a timer that expires `duration` from now.
    #[must_use]
    pub fn timer(&self, duration: Duration) -> Timer {
        Timer {
            started: self.now(),
            duration,
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl core::fmt::Debug for Clock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Clock").finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Timer
// ─────────────────────────────────────────────────────────────────────────────

/// A fixed duration measured against a [`Clock`].
///
/// Timers hold no reference to the clock, so the same timer can be checked
/// once per tick from inside a command body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    started: Instant,
    duration: Duration,
}

impl Timer {
    /// Returns when the timer was started.
    #[must_use]
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Returns `true` once the full duration has passed on `clock`.
    #[must_use]
    pub fn has_elapsed(&self, clock: &Clock) -> bool {
        clock.elapsed_since(self.started) >= self.duration
    }

    /// Returns the time left before the timer expires.
    #[must_use]
    pub fn remaining(&self, clock: &Clock) -> Duration {
        self.duration
            .saturating_sub(clock.elapsed_since(self.started))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MockClock
// ─────────────────────────────────────────────────────────────────────────────

/// Manually driven clock for deterministic tests.
///
/// ```
/// use std::sync::Arc;
/// use std::time::{Duration, Instant};
/// use cadence_commands::scheduler::Scheduler;
/// use cadence_commands::time::MockClock;
///
/// let mock = Arc::new(MockClock::new(Instant::now()));
/// let scheduler = Scheduler::builder().with_clock(mock.clone()).build();
///
/// let start = scheduler.clock().now();
/// mock.advance(Duration::from_millis(20));
/// assert_eq!(scheduler.clock().elapsed_since(start), Duration::from_millis(20));
/// ```
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug)]
pub struct MockClock {
    current: parking_lot::RwLock<Instant>,
}

#[cfg(any(test, feature = "test-utils"))]
impl MockClock {
    /// Creates a clock stopped at `start`.
    #[must_use]
    pub fn new(start: Instant) -> Self {
        Self {
            current: parking_lot::RwLock::new(start),
        }
    }

    /// Moves time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        *self.current.write() += duration;
    }

    /// Jumps to `instant`, which may be in the past.
    pub fn set(&self, instant: Instant) {
        *self.current.write() = instant;
    }

    /// Returns the instant the clock is stopped at.
    #[must_use]
    pub fn current(&self) -> Instant {
        *self.current.read()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl ClockProvider for MockClock {
    fn now(&self) -> Instant {
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock() -> (Arc<MockClock>, Clock) {
        let mock = Arc::new(MockClock::new(Instant::now()));
        let clock = Clock::with_provider(mock.clone());
        (mock, clock)
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = Clock::default();
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }

    #[test]
    fn elapsed_since_a_future_instant_is_zero() {
        let (mock, clock) = mock();
        let later = mock.current() + Duration::from_secs(5);
        assert_eq!(clock.elapsed_since(later), Duration::ZERO);
    }

    #[test]
    fn mock_clock_moves_only_when_told() {
        let (mock, clock) = mock();
        let start = clock.now();
        assert_eq!(clock.now(), start);

        mock.advance(Duration::from_millis(20));
        assert_eq!(clock.elapsed_since(start), Duration::from_millis(20));

        mock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn timer_expires_after_its_duration() {
        let (mock, clock) = mock();
        let timer = clock.timer(Duration::from_millis(50));

        mock.advance(Duration::from_millis(40));
        assert!(!timer.has_elapsed(&clock));
        assert_eq!(timer.remaining(&clock), Duration::from_millis(10));

        mock.advance(Duration::from_millis(10));
        assert!(timer.has_elapsed(&clock));
        assert_eq!(timer.remaining(&clock), Duration::ZERO);
    }

    #[test]
    fn zero_timer_has_already_elapsed() {
        let (_mock, clock) = mock();
        assert!(clock.timer(Duration::ZERO).has_elapsed(&clock));
    }
}
