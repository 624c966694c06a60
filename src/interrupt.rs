//! Optional Event Source wrapping OS signals, feature-gated behind
//! `interrupt` since it pulls in `signal-hook`/`signal-hook-mio` and is
//! unix-only.

use std::any::Any;

use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_mio::v0_8::Signals;

use crate::error::Error;
use crate::poller::{Interest, Poller, Readiness};
use crate::source::{EventSource, SourceSlot, SourceState, Tag};

pub type InterruptCallback = Box<dyn FnMut(i32)>;

/// Listens for `SIGINT`/`SIGTERM` and invokes `callback` once per delivered
/// signal.
pub struct InterruptManager {
    state: SourceState,
    signals: Option<Signals>,
    callback: InterruptCallback,
}

impl InterruptManager {
    pub fn new(callback: InterruptCallback) -> Self {
        InterruptManager {
            state: SourceState::Fresh,
            signals: None,
            callback,
        }
    }
}

impl EventSource for InterruptManager {
    fn tag(&self) -> Tag {
        Tag::Interrupt
    }

    fn state(&self) -> SourceState {
        self.state
    }

    fn start(&mut self, poller: &Poller, slot: SourceSlot) -> Result<(), Error> {
        let mut signals = Signals::new([SIGINT, SIGTERM])
            .map_err(|e| Error::OutOfResources(format!("signal registration failed: {e}")))?;

        poller.register(
            &mut signals,
            crate::source::make_token(slot, 0),
            Interest::Read,
        )?;

        self.signals = Some(signals);
        self.state = SourceState::Started;
        Ok(())
    }

    fn stop(&mut self, poller: &Poller) {
        if let Some(mut signals) = self.signals.take() {
            let _ = poller.unregister(&mut signals);
        }
        self.state = SourceState::Stopped;
    }

    fn free(&mut self, _poller: &Poller) {
        self.signals = None;
    }

    fn on_poll_event(&mut self, _poller: &Poller, _local_token: u64, _readiness: Readiness) {
        let Some(signals) = self.signals.as_mut() else {
            return;
        };

        for signum in signals.pending() {
            (self.callback)(signum);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
