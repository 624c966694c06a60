use std::cell::Cell;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A loop's own notion of time, kept distinct from any logger's clock so
/// tests can drive a simulated clock without touching wall time.
pub trait Clock {
    /// Wall-clock time, as a duration since the Unix epoch.
    fn now(&self) -> Duration;

    /// Monotonic time, used for all scheduling decisions (timer fire times,
    /// poller deadlines). Never goes backwards.
    fn now_monotonic(&self) -> Instant;

    /// The local UTC offset, in seconds east of UTC.
    fn local_utc_offset(&self) -> i32;
}

/// The default clock: real wall time and `Instant::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }

    fn now_monotonic(&self) -> Instant {
        Instant::now()
    }

    fn local_utc_offset(&self) -> i32 {
        // No portable, dependency-free way to query the local UTC offset;
        // callers that need it should read it from their own environment.
        // The event loop never relies on this value for scheduling, but on
        // any host whose local zone isn't UTC this always reports 0 (UTC),
        // not the host's actual offset.
        0
    }
}

/// A clock whose monotonic time is advanced manually, for deterministic
/// tests of timer phase alignment and catch-up behavior.
pub struct SimulatedClock {
    monotonic: Cell<Instant>,
    wall: Cell<Duration>,
}

impl SimulatedClock {
    pub fn new() -> Self {
        SimulatedClock {
            monotonic: Cell::new(Instant::now()),
            wall: Cell::new(Duration::ZERO),
        }
    }

    /// Advances both the monotonic and wall clocks by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.monotonic.set(self.monotonic.get() + delta);
        self.wall.set(self.wall.get() + delta);
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Duration {
        self.wall.get()
    }

    fn now_monotonic(&self) -> Instant {
        self.monotonic.get()
    }

    fn local_utc_offset(&self) -> i32 {
        0
    }
}
