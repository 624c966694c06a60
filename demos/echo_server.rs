//! Listens on 127.0.0.1:7878 and echoes back whatever each client sends,
//! closing once the peer does. Run with `cargo run --example echo-server`.
//!
//! The connection callback has no direct handle back to the
//! `TcpConnectionManager` that owns it (it would alias `&mut self`), so
//! inbound payloads are staged in a shared queue and flushed into
//! `send_with_connection` after each `run` call returns — the same
//! indirection a caller needs any time a callback wants to act back on its
//! own Event Source.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use revent::{
    BufferAllocator, ConnectionEvent, ConnectionId, EventLoop, ParamKey, ParamMap, ParamValue,
    Status, TcpConnectionManager,
};

fn main() -> Result<()> {
    env_logger::init();

    let pending_echoes: Rc<RefCell<Vec<(ConnectionId, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));
    let pending_echoes_cb = pending_echoes.clone();

    let callback = Box::new(move |event: ConnectionEvent, _ctx: &mut Box<dyn Any>| {
        let id = event.id;
        match event.status {
            Status::Good if !event.payload.is_empty() => {
                log::info!("{id:?}: queuing echo of {} bytes", event.payload.len());
                pending_echoes_cb
                    .borrow_mut()
                    .push((id, event.payload.to_vec()));
            }
            Status::Good => log::info!("{id:?}: connected"),
            Status::ConnectionClosed => log::info!("{id:?}: closed"),
            Status::ConnectionRejected => log::warn!("{id:?}: rejected"),
        }
    });

    let make_context = Box::new(|| -> Box<dyn Any> { Box::new(()) });

    let manager = TcpConnectionManager::new("echo", callback, make_context);
    let mut manager = manager;

    let mut config = ParamMap::new();
    config.set(ParamKey::reference("listen-port"), ParamValue::U16(7878));
    config.set(
        ParamKey::reference("listen-hostnames"),
        ParamValue::String("127.0.0.1".into()),
    );
    manager.configure(config);

    let mut event_loop = EventLoop::new()?;
    event_loop.register_event_source("echo", Box::new(manager))?;
    event_loop.start()?;

    log::info!("listening on 127.0.0.1:7878");
    let allocator = BufferAllocator::new();

    loop {
        event_loop.run(Some(Duration::from_millis(100)))?;

        let echoes: Vec<(ConnectionId, Vec<u8>)> = pending_echoes.borrow_mut().drain(..).collect();
        if echoes.is_empty() {
            continue;
        }

        let source = event_loop
            .find_event_source_mut("echo")
            .ok_or_else(|| anyhow!("echo source missing"))?;
        let manager = source
            .as_any_mut()
            .downcast_mut::<TcpConnectionManager>()
            .ok_or_else(|| anyhow!("echo source is not a TcpConnectionManager"))?;

        for (id, payload) in echoes {
            let buf = allocator.alloc(&payload);
            if let Err(e) = manager.send_with_connection(id, buf) {
                log::warn!("{id:?}: echo send failed: {e}");
            }
        }
    }
}
