use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest as MioInterest, Poll, Registry, Token};

use crate::error::Error;

/// Read/write interest for a registered file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

impl Interest {
    pub(crate) fn to_mio(self) -> MioInterest {
        match self {
            Interest::Read => MioInterest::READABLE,
            Interest::Write => MioInterest::WRITABLE,
            Interest::ReadWrite => MioInterest::READABLE.add(MioInterest::WRITABLE),
        }
    }
}

/// A readiness notification, routed by the loop to the Event Source that
/// owns `token`. The Poller itself knows nothing about Connections or
/// Sources — it only reports which token became ready and how.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

/// OS multiplexer abstraction: register/unregister file descriptors with
/// read/write interest, wait up to a deadline. Backed by `mio::Poll`.
pub struct Poller {
    poll: Poll,
    registry: Registry,
}

/// The token reserved for the cross-thread wakeup source (`mio::Waker`).
/// Event Sources must not register a connection/fd under this token.
pub const WAKE_TOKEN: Token = Token(0);

impl Poller {
    pub fn new() -> Result<Self, Error> {
        let poll =
            Poll::new().map_err(|e| Error::OutOfResources(format!("Poll::new failed: {e}")))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|e| Error::OutOfResources(format!("registry clone failed: {e}")))?;
        Ok(Poller { poll, registry })
    }

    /// A clonable handle usable to register sources without borrowing the
    /// whole Poller, and to build a [`mio::Waker`] for the Delayed Queue.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Builds a waker registered at [`WAKE_TOKEN`], used to pull a blocked
    /// `wait` out of its poll when a delayed callback is enqueued from
    /// another thread.
    pub fn make_waker(&self) -> Result<mio::Waker, Error> {
        mio::Waker::new(&self.registry, WAKE_TOKEN)
            .map_err(|e| Error::OutOfResources(format!("waker creation failed: {e}")))
    }

    pub fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), Error> {
        self.registry
            .register(source, token, interest.to_mio())
            .map_err(|e| Error::OutOfResources(format!("poller register failed: {e}")))
    }

    pub fn reregister<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), Error> {
        self.registry
            .reregister(source, token, interest.to_mio())
            .map_err(|e| Error::OutOfResources(format!("poller reregister failed: {e}")))
    }

    pub fn unregister<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.registry.deregister(source)
    }

    /// Blocks (if `deadline` is `Some`) until at least one fd is ready or the
    /// deadline elapses, then returns the readiness list. `deadline = Some(0)`
    /// polls without blocking; `None` blocks indefinitely. Spurious wakeups
    /// (including the reserved wake token) are filtered out here, so callers
    /// never see a bogus readiness entry for it.
    pub fn wait(&mut self, deadline: Option<Duration>) -> Result<Vec<Readiness>, Error> {
        let mut events = Events::with_capacity(1024);
        self.poll
            .poll(&mut events, deadline)
            .map_err(|e| Error::Internal(format!("poll wait failed: {e}")))?;

        Ok(events
            .iter()
            .filter(|event| event.token() != WAKE_TOKEN)
            .map(|event| Readiness {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
            })
            .collect())
    }
}
