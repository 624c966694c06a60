//! A cooperative, single-threaded event loop: a Timer Heap, a thread-safe
//! Delayed Queue, an OS Poller, and a pluggable set of Event Sources — of
//! which the TCP Connection Manager is the one shipped here.
//!
//! Nothing in this crate spawns a thread of its own; [`EventLoop::run`] must
//! be driven by the caller, one dispatch cycle per call.

mod buffer;
mod clock;
mod delayed;
mod error;
mod event_loop;
mod param;
mod poller;
mod source;
mod tcp;
mod timer;

#[cfg(feature = "interrupt")]
mod interrupt;

pub use buffer::{BufferAllocator, RecvSlice, SendBuffer};
pub use clock::{Clock, SimulatedClock, SystemClock};
pub use delayed::{DelayedCallback, DelayedQueue, DelayedSender};
pub use error::{Error, Status};
pub use event_loop::{EventLoop, LoopState};
pub use param::{ParamKey, ParamMap, ParamValue};
pub use poller::{Interest, Poller, Readiness};
pub use source::{EventSource, Registry, SourceSlot, SourceState, Tag};
pub use tcp::{
    ConnectionCallback, ConnectionEvent, ConnectionId, ConnectionKind, ContextFactory,
    TcpConnectionManager,
};
pub use timer::{TimerCallback, TimerHeap, TimerId, TimerPolicy};

#[cfg(feature = "interrupt")]
pub use interrupt::{InterruptCallback, InterruptManager};
