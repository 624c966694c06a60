use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::delayed::{DelayedCallback, DelayedQueue, DelayedSender};
use crate::error::Error;
use crate::param::ParamMap;
use crate::poller::Poller;
use crate::source::{split_token, EventSource, Registry, SourceSlot};
use crate::timer::{TimerCallback, TimerHeap, TimerId, TimerPolicy};

/// Lifecycle state of the loop itself. `Stopped` is terminal for purposes
/// of re-use; `free` is only legal from `Stopped` or `Fresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Fresh,
    Started,
    Stopping,
    Stopped,
}

/// The cooperative, single-threaded orchestrator tying the Poller, Timer
/// Heap, Delayed Queue, and Event Source registry together.
///
/// This loop dispatches only into [`EventSource`] implementations — there
/// is no embedded language runtime or scripting layer underneath it.
pub struct EventLoop {
    state: LoopState,
    poller: Poller,
    sources: Registry,
    timers: TimerHeap,
    delayed: DelayedQueue,
    clock: Box<dyn Clock>,
    config: ParamMap,
    running: Cell<bool>,
}

impl EventLoop {
    /// Builds a loop with the real system clock.
    pub fn new() -> Result<Self, Error> {
        Self::with_clock(Box::new(SystemClock))
    }

    /// Builds a loop with an injected clock (e.g.
    /// [`crate::clock::SimulatedClock`] for deterministic timer tests),
    /// distinct from whatever clock a logger uses — each loop carries its
    /// own clock domain.
    ///
    /// The Poller is constructed here rather than deferred to [`Self::start`]:
    /// `register_event_source`/`find_event_source` are meaningful before the
    /// loop ever runs, so the OS polling handle is acquired eagerly at
    /// construction instead.
    pub fn with_clock(clock: Box<dyn Clock>) -> Result<Self, Error> {
        let poller = Poller::new()?;
        let waker = Arc::new(poller.make_waker()?);
        let delayed = DelayedQueue::new();
        delayed.install_waker(waker);

        Ok(EventLoop {
            state: LoopState::Fresh,
            poller,
            sources: Registry::new(),
            timers: TimerHeap::new(),
            delayed,
            clock,
            config: ParamMap::new(),
            running: Cell::new(false),
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// The loop-level configuration map (namespace 0 reserved).
    pub fn config(&self) -> &ParamMap {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ParamMap {
        &mut self.config
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub fn now_monotonic(&self) -> Instant {
        self.clock.now_monotonic()
    }

    pub fn local_utc_offset(&self) -> i32 {
        self.clock.local_utc_offset()
    }

    /// A cloneable, `Send` handle for enqueueing delayed callbacks from any
    /// thread — the only part of this API safe to call off the loop's own
    /// thread.
    pub fn delayed_sender(&self) -> DelayedSender {
        self.delayed.sender()
    }

    pub fn add_delayed_callback(&self, callback: DelayedCallback) {
        self.delayed.sender().enqueue(callback);
    }

    pub fn add_cyclic(
        &mut self,
        interval: Duration,
        base_time: Option<Instant>,
        policy: TimerPolicy,
        callback: TimerCallback,
    ) -> Result<TimerId, Error> {
        let now = self.clock.now_monotonic();
        self.timers
            .add_cyclic(now, interval, base_time, policy, callback)
    }

    pub fn add_timed(&mut self, when: Instant, callback: TimerCallback) -> TimerId {
        self.timers.add_timed(when, callback)
    }

    pub fn modify_cyclic(
        &mut self,
        id: TimerId,
        interval: Duration,
        base_time: Option<Instant>,
        policy: TimerPolicy,
    ) -> Result<(), Error> {
        let now = self.clock.now_monotonic();
        self.timers
            .modify_cyclic(now, id, interval, base_time, policy)
    }

    pub fn remove_timer(&mut self, id: TimerId) {
        self.timers.remove(id)
    }

    pub fn next_timer_time(&self) -> Option<Instant> {
        self.timers.next_time()
    }

    /// Attaches `source` under `name`. If the loop is already `Started` (or
    /// `Stopping`), the source is started immediately; otherwise it starts
    /// along with every other source when [`Self::start`] runs.
    ///
    /// If an immediate start fails, the source stays registered but not
    /// started, the same way a failed loop-wide `start` leaves things: the
    /// caller is expected to deregister and let it be freed.
    pub fn register_event_source(
        &mut self,
        name: impl Into<String>,
        source: Box<dyn EventSource>,
    ) -> Result<(), Error> {
        let slot = self.sources.register(name, source)?;

        if matches!(self.state, LoopState::Started | LoopState::Stopping) {
            let poller = &self.poller;
            if let Some(source) = self.sources.get_mut(slot) {
                source.start(poller, slot)?;
            }
        }

        Ok(())
    }

    /// Requests `name` stop; removal happens once it reports `Stopped`, on a
    /// later dispatch cycle. Returns immediately — actual removal may be
    /// asynchronous.
    pub fn deregister_event_source(&mut self, name: &str) {
        self.sources.request_stop(name, &self.poller);
    }

    pub fn find_event_source(&self, name: &str) -> Option<&dyn EventSource> {
        self.sources.find(name)
    }

    pub fn find_event_source_mut(&mut self, name: &str) -> Option<&mut dyn EventSource> {
        self.sources.find_mut(name)
    }

    /// Starts the loop: initializes state, then starts every registered
    /// source in registration order. Aborts on the first start failure —
    /// already-started sources remain started, and the caller is then
    /// expected to `stop` then `free`.
    pub fn start(&mut self) -> Result<(), Error> {
        if !matches!(self.state, LoopState::Fresh | LoopState::Stopped) {
            return Err(Error::InvalidState(format!(
                "start is invalid from state {:?}",
                self.state
            )));
        }

        self.state = LoopState::Started;

        let poller = &self.poller;
        for (slot, source) in self.sources.iter_mut() {
            source.start(poller, slot)?;
        }

        Ok(())
    }

    /// Requests every source stop and transitions to `Stopping`. Returns
    /// immediately — reaching `Stopped` requires further `run` calls.
    pub fn stop(&mut self) -> Result<(), Error> {
        if self.state != LoopState::Started {
            return Err(Error::InvalidState(format!(
                "stop is invalid from state {:?}",
                self.state
            )));
        }

        self.state = LoopState::Stopping;

        let poller = &self.poller;
        for (_slot, source) in self.sources.iter_mut() {
            source.stop(poller);
        }

        Ok(())
    }

    /// Releases every owned resource: each source's `free` is invoked in
    /// reverse registration order, then the Registry, Timer Heap, and
    /// Delayed Queue are reset. The underlying Poller's OS handle is
    /// released the ordinary Rust way, on `Drop` of the `EventLoop` itself,
    /// rather than through an explicit teardown step here.
    pub fn free(&mut self) -> Result<(), Error> {
        if !matches!(self.state, LoopState::Fresh | LoopState::Stopped) {
            return Err(Error::InvalidState(format!(
                "free is invalid from state {:?}",
                self.state
            )));
        }

        let poller = &self.poller;
        for (_slot, source) in self.sources.iter_mut_rev() {
            source.free(poller);
        }

        self.sources = Registry::new();
        self.timers = TimerHeap::new();
        self.delayed = DelayedQueue::new();

        Ok(())
    }

    /// Executes exactly one dispatch cycle. Fails with `Internal` if another
    /// call to `run` is already in flight on this loop — callbacks invoked
    /// from within a cycle must never re-enter `run`.
    ///
    /// Returns the next timer's scheduled monotonic instant once this cycle
    /// completes, or `None` if no timer is pending, rendered here as an
    /// `Option` rather than a sentinel "far future" value.
    pub fn run(&mut self, timeout: Option<Duration>) -> Result<Option<Instant>, Error> {
        if self.running.get() {
            return Err(Error::Internal("run is not reentrant".into()));
        }

        self.running.set(true);
        let result = self.dispatch_cycle(timeout);
        self.running.set(false);
        result
    }

    fn dispatch_cycle(&mut self, timeout: Option<Duration>) -> Result<Option<Instant>, Error> {
        // Step 1: delayed callbacks, FIFO, newly enqueued ones deferred to
        // the next cycle.
        self.delayed.drain_and_run();

        // Step 2: compute the poll deadline from the caller's timeout, the
        // next timer's due time, and immediate (0) if any source is
        // Stopping — all before firing due timers (firing happens in step 3
        // regardless of the deadline computed here).
        let now = self.clock.now_monotonic();
        let mut deadline = timeout;

        if let Some(next) = self.timers.next_time() {
            let until_next = next.saturating_duration_since(now);
            deadline = Some(match deadline {
                Some(d) => d.min(until_next),
                None => until_next,
            });
        }

        if self.state == LoopState::Stopping {
            deadline = Some(Duration::ZERO);
        }

        // Step 3: fire every due timer.
        self.timers.fire_due(now);

        // Step 4: poll, then dispatch readiness to the owning source.
        let readiness = self.poller.wait(deadline)?;
        for ready in readiness {
            let (slot, local_token) = split_token(ready.token);
            let poller = &self.poller;
            if let Some(source) = self.sources.get_mut(slot) {
                if catch_unwind(AssertUnwindSafe(|| {
                    source.on_poll_event(poller, local_token, ready)
                }))
                .is_err()
                {
                    log::error!("event source panicked handling a readiness event");
                }
            }
        }

        // Per-cycle housekeeping independent of readiness (e.g. TCP's
        // deferred close callbacks), then reap any source that has fully
        // stopped.
        for (_slot, source) in self.sources.iter_mut() {
            if catch_unwind(AssertUnwindSafe(|| source.on_tick())).is_err() {
                log::error!("event source panicked during on_tick");
            }
        }
        self.sources.reap_stopped(&self.poller);

        // Step 5: Stopping -> Stopped once every source has reported so.
        if self.state == LoopState::Stopping && self.sources.all_stopped() {
            self.state = LoopState::Stopped;
        }

        Ok(self.timers.next_time())
    }
}
