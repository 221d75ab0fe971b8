//! Clock abstraction for lease expiry, backoff scheduling and sleeps.
//!
//! Everything time-dependent in the delivery path reads the clock through
//! [`Clock`] so tests can drive visibility timeouts and lease expiry
//! deterministically with [`TestClock`].

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Source of monotonic time, wall-clock time and sleeps.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant used for measuring attempt durations.
    fn now(&self) -> Instant;

    /// Wall-clock time used for persisted timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the given duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Production clock backed by the OS and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for tests.
///
/// Time only moves when [`TestClock::advance`] or [`TestClock::jump_to`] is
/// called, or when a task sleeps on it. Clones share the same timeline.
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    epoch_ns: Arc<AtomicU64>,
    origin: Instant,
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock starting at `start`.
    pub fn with_start_time(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            epoch_ns: Arc::new(AtomicU64::new(saturating_nanos(since_epoch))),
            origin: Instant::now(),
        }
    }

    /// Moves both monotonic and wall-clock time forward.
    pub fn advance(&self, duration: Duration) {
        let ns = saturating_nanos(duration);
        self.elapsed_ns.fetch_add(ns, Ordering::AcqRel);
        self.epoch_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Sets wall-clock time to `time`.
    ///
    /// Jumping forward also advances monotonic time. Jumping backwards only
    /// rewinds wall-clock time; the monotonic reading never decreases.
    pub fn jump_to(&self, time: SystemTime) {
        let target = saturating_nanos(time.duration_since(UNIX_EPOCH).unwrap_or_default());
        let current = self.epoch_ns.load(Ordering::Acquire);
        if target > current {
            self.advance(Duration::from_nanos(target - current));
        } else {
            self.epoch_ns.store(target, Ordering::Release);
        }
    }

    /// Total monotonic time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.epoch_ns.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        // sleeping advances virtual time and yields once
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
