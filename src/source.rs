use std::any::Any;
use std::collections::HashMap;

use mio::Token;

use crate::error::Error;
use crate::poller::{Poller, Readiness};

/// Discriminates concrete Event Source kinds. Closed by design: the loop
/// needs to downcast a `dyn EventSource` back to its concrete type only
/// for the kinds it actually knows about, so a tagged enum plus
/// `std::any::Any` replaces an open-ended downcasting crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    ConnectionManager,
    Interrupt,
}

/// Lifecycle state of an Event Source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Fresh,
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Identifies the registry slot an Event Source occupies, used to route
/// Poller readiness back to the right source without the source needing a
/// back-pointer to its owning loop: the loop owns the storage, and sources
/// hold only this non-owning handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceSlot(u16);

/// Bits of a `mio::Token` reserved for the owning source's slot; the
/// remainder identifies a connection (or other sub-resource) local to that
/// source. Slot 0 is reserved so it never aliases [`crate::poller::WAKE_TOKEN`].
const SLOT_SHIFT: u32 = 48;
const LOCAL_MASK: usize = (1usize << SLOT_SHIFT) - 1;

pub fn make_token(slot: SourceSlot, local: u64) -> Token {
    Token(((slot.0 as usize) << SLOT_SHIFT) | (local as usize & LOCAL_MASK))
}

pub fn split_token(token: Token) -> (SourceSlot, u64) {
    let raw = token.0;
    let slot = (raw >> SLOT_SHIFT) as u16;
    let local = (raw & LOCAL_MASK) as u64;
    (SourceSlot(slot), local)
}

/// The capability set every pluggable Event Source implements: start, stop,
/// free, and on_poll_event behind a tagged discriminator, in place of a
/// base-struct-plus-vtable hierarchy.
pub trait EventSource: Any {
    fn tag(&self) -> Tag;
    fn state(&self) -> SourceState;

    /// Starts the source: bind listeners, register fds, etc. Called
    /// immediately by `registerEventSource` if the loop is already Started,
    /// or by the loop's own `start` otherwise.
    fn start(&mut self, poller: &Poller, slot: SourceSlot) -> Result<(), Error>;

    /// Requests the source stop. Must not block; the source may take
    /// several dispatch cycles to reach `Stopped`.
    fn stop(&mut self, poller: &Poller);

    /// Releases every resource owned by the source. Only called once the
    /// source has reached `Stopped` or was never started.
    fn free(&mut self, poller: &Poller);

    /// Routes one readiness notification for a token local to this source.
    fn on_poll_event(&mut self, poller: &Poller, local_token: u64, readiness: Readiness);

    /// Per-cycle housekeeping independent of I/O readiness (e.g. flushing
    /// deferred close callbacks). Default no-op.
    fn on_tick(&mut self) {}

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct Entry {
    name: String,
    source: Box<dyn EventSource>,
    pending_removal: bool,
}

/// Named collection of Event Sources with lifecycle coupling to the loop.
/// Owns every source; sources are addressed by name or by the non-owning
/// [`SourceSlot`] handed out at registration.
#[derive(Default)]
pub struct Registry {
    slots: Vec<Option<Entry>>,
    name_to_slot: HashMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            // Index 0 is never assigned so SourceSlot(0) stays reserved
            // alongside the poller's wake token.
            slots: vec![None],
            name_to_slot: HashMap::new(),
        }
    }

    /// Registers `source` under `name`. Fails with `NameConflict` if the
    /// name is already taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        source: Box<dyn EventSource>,
    ) -> Result<SourceSlot, Error> {
        let name = name.into();
        if self.name_to_slot.contains_key(&name) {
            return Err(Error::NameConflict(name));
        }

        let index = self.slots.len();
        self.slots.push(Some(Entry {
            name: name.clone(),
            source,
            pending_removal: false,
        }));
        self.name_to_slot.insert(name, index);

        Ok(SourceSlot(index as u16))
    }

    pub fn find(&self, name: &str) -> Option<&dyn EventSource> {
        let index = *self.name_to_slot.get(name)?;
        self.slots[index].as_ref().map(|e| e.source.as_ref())
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut (dyn EventSource + 'static)> {
        let index = *self.name_to_slot.get(name)?;
        self.slots[index].as_mut().map(|e| e.source.as_mut())
    }

    pub fn get_mut(&mut self, slot: SourceSlot) -> Option<&mut (dyn EventSource + 'static)> {
        self.slots
            .get_mut(slot.0 as usize)?
            .as_mut()
            .map(|e| e.source.as_mut())
    }

    /// Requests `name` stop; the entry is only removed once `reap_stopped`
    /// observes it has reached `Stopped`. A name that is not registered, or
    /// already pending removal, is a no-op (idempotent deregistration).
    pub fn request_stop(&mut self, name: &str, poller: &Poller) {
        let Some(&index) = self.name_to_slot.get(name) else {
            return;
        };
        if let Some(entry) = self.slots[index].as_mut() {
            if entry.pending_removal {
                return;
            }
            entry.source.stop(poller);
            entry.pending_removal = true;
        }
    }

    /// Removes every source marked for removal that has reached `Stopped`,
    /// calling `free` on each as it's removed.
    pub fn reap_stopped(&mut self, poller: &Poller) {
        for slot in self.slots.iter_mut() {
            let should_remove = matches!(
                slot,
                Some(entry) if entry.pending_removal && entry.source.state() == SourceState::Stopped
            );
            if should_remove {
                if let Some(mut entry) = slot.take() {
                    entry.source.free(poller);
                    self.name_to_slot.remove(&entry.name);
                }
            }
        }
    }

    /// True once every registered source has reached `Stopped` (including
    /// the case where none are registered) — the condition that lets the
    /// loop finish its own Stopping→Stopped transition.
    pub fn all_stopped(&self) -> bool {
        self.slots
            .iter()
            .flatten()
            .all(|entry| entry.source.state() == SourceState::Stopped)
    }

    /// Iterates live sources in registration order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SourceSlot, &mut dyn EventSource)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, slot)| {
            slot.as_mut()
                .map(|entry| (SourceSlot(i as u16), entry.source.as_mut()))
        })
    }

    /// Iterates live sources in reverse registration order (used by `free`).
    pub fn iter_mut_rev(&mut self) -> impl Iterator<Item = (SourceSlot, &mut dyn EventSource)> {
        self.slots
            .iter_mut()
            .enumerate()
            .rev()
            .filter_map(|(i, slot)| {
                slot.as_mut()
                    .map(|entry| (SourceSlot(i as u16), entry.source.as_mut()))
            })
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummySource {
        state: SourceState,
    }

    impl EventSource for DummySource {
        fn tag(&self) -> Tag {
            Tag::ConnectionManager
        }
        fn state(&self) -> SourceState {
            self.state
        }
        fn start(&mut self, _poller: &Poller, _slot: SourceSlot) -> Result<(), Error> {
            self.state = SourceState::Started;
            Ok(())
        }
        fn stop(&mut self, _poller: &Poller) {
            self.state = SourceState::Stopped;
        }
        fn free(&mut self, _poller: &Poller) {}
        fn on_poll_event(&mut self, _poller: &Poller, _local_token: u64, _readiness: Readiness) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn duplicate_name_is_conflict() {
        let mut registry = Registry::new();
        registry
            .register(
                "a",
                Box::new(DummySource {
                    state: SourceState::Fresh,
                }),
            )
            .unwrap();
        let err = registry.register(
            "a",
            Box::new(DummySource {
                state: SourceState::Fresh,
            }),
        );
        assert!(matches!(err, Err(Error::NameConflict(_))));
    }

    #[test]
    fn deregister_then_reap_removes_entry() {
        let mut registry = Registry::new();
        let poller = Poller::new().unwrap();
        registry
            .register(
                "a",
                Box::new(DummySource {
                    state: SourceState::Started,
                }),
            )
            .unwrap();

        registry.request_stop("a", &poller);
        assert!(registry.find("a").is_some());

        registry.reap_stopped(&poller);
        assert!(registry.find("a").is_none());
        assert!(registry.all_stopped());
    }

    #[test]
    fn deregistering_unknown_name_is_noop() {
        let mut registry = Registry::new();
        let poller = Poller::new().unwrap();
        registry.request_stop("missing", &poller);
        assert!(registry.is_empty());
    }

    #[test]
    fn token_packing_round_trips() {
        let slot = SourceSlot(42);
        let token = make_token(slot, 123456);
        let (slot2, local2) = split_token(token);
        assert_eq!(slot2, slot);
        assert_eq!(local2, 123456);
    }
}
