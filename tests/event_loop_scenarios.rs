//! End-to-end scenarios driving `EventLoop` through realistic multi-cycle
//! sequences: listen/accept/close, outbound loopback echo, peer-close
//! byte-accounting, send-after-close, a true self-connect loopback, and
//! reentrant-`run` rejection from inside a live callback.

use std::any::Any;
use std::cell::RefCell;
use std::io::Write;
use std::net::TcpStream as StdTcpStream;
use std::rc::Rc;
use std::time::Duration;

use revent::{
    BufferAllocator, ConnectionEvent, ConnectionId, Error, EventLoop, ParamKey, ParamMap,
    ParamValue, Status, TcpConnectionManager,
};

fn run_until<F: Fn() -> bool>(event_loop: &mut EventLoop, timeout: Duration, done: F) {
    let deadline = event_loop.now_monotonic() + timeout;
    while !done() && event_loop.now_monotonic() < deadline {
        event_loop.run(Some(Duration::from_millis(20))).unwrap();
    }
}

fn make_logging_manager(
    name: &str,
    log: Rc<RefCell<Vec<(ConnectionId, Status, Vec<u8>)>>>,
) -> TcpConnectionManager {
    let cb_log = log.clone();
    let callback = Box::new(move |event: ConnectionEvent, _ctx: &mut Box<dyn Any>| {
        cb_log
            .borrow_mut()
            .push((event.id, event.status, event.payload.to_vec()));
    });
    TcpConnectionManager::new(name, callback, Box::new(|| Box::new(())))
}

fn listen_config(port: u16) -> ParamMap {
    let mut config = ParamMap::new();
    config.set(ParamKey::reference("listen-port"), ParamValue::U16(port));
    config.set(
        ParamKey::reference("listen-hostnames"),
        ParamValue::String("127.0.0.1".into()),
    );
    config
}

fn manager_mut(event_loop: &mut EventLoop, name: &str) -> &mut TcpConnectionManager {
    event_loop
        .find_event_source_mut(name)
        .unwrap()
        .as_any_mut()
        .downcast_mut::<TcpConnectionManager>()
        .unwrap()
}

#[test]
fn listen_then_stop_reaches_stopped_with_no_connections() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut manager = make_logging_manager("tcp", log.clone());
    manager.configure(listen_config(17_881));

    let mut event_loop = EventLoop::new().unwrap();
    event_loop
        .register_event_source("tcp", Box::new(manager))
        .unwrap();
    event_loop.start().unwrap();

    event_loop.run(Some(Duration::from_millis(10))).unwrap();

    event_loop.stop().unwrap();
    run_until(&mut event_loop, Duration::from_secs(2), || {
        event_loop.state() == revent::LoopState::Stopped
    });

    assert_eq!(event_loop.state(), revent::LoopState::Stopped);
    assert!(log.borrow().is_empty());
}

#[test]
fn listener_accepts_a_real_client_and_observes_its_bytes() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut manager = make_logging_manager("tcp", log.clone());
    manager.configure(listen_config(17_882));

    let mut event_loop = EventLoop::new().unwrap();
    event_loop
        .register_event_source("tcp", Box::new(manager))
        .unwrap();
    event_loop.start().unwrap();
    event_loop.run(Some(Duration::from_millis(10))).unwrap();

    let mut client = StdTcpStream::connect("127.0.0.1:17882").unwrap();
    client.write_all(b"hello").unwrap();

    run_until(&mut event_loop, Duration::from_secs(2), || {
        log.borrow()
            .iter()
            .any(|(_, s, payload)| *s == Status::Good && payload == b"hello")
    });

    let entries = log.borrow();
    let accept_event = entries
        .iter()
        .find(|(_, s, payload)| *s == Status::Good && payload.is_empty());
    assert!(accept_event.is_some(), "expected an empty-payload accept callback");

    let data_event = entries
        .iter()
        .find(|(_, s, payload)| *s == Status::Good && payload == b"hello");
    assert!(data_event.is_some(), "expected the echoed payload to be observed");
}

#[test]
fn outbound_connect_send_and_peer_close_are_observed_in_order() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let manager = make_logging_manager("tcp", log.clone());

    let peer_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let peer_addr = peer_listener.local_addr().unwrap();
    peer_listener.set_nonblocking(true).unwrap();

    let mut event_loop = EventLoop::new().unwrap();
    event_loop
        .register_event_source("tcp", Box::new(manager))
        .unwrap();
    event_loop.start().unwrap();

    let id = manager_mut(&mut event_loop, "tcp")
        .open_connection(&peer_addr.ip().to_string(), peer_addr.port())
        .unwrap();

    run_until(&mut event_loop, Duration::from_secs(2), || {
        log.borrow().iter().any(|(i, s, _)| *i == id && s.is_good())
    });
    assert!(log.borrow().iter().any(|(i, s, _)| *i == id && s.is_good()));

    let (mut peer_stream, _) = peer_listener.accept().unwrap();
    peer_stream.set_nonblocking(false).unwrap();
    peer_stream.write_all(b"ping").unwrap();

    run_until(&mut event_loop, Duration::from_secs(2), || {
        log.borrow()
            .iter()
            .any(|(i, s, payload)| *i == id && *s == Status::Good && payload == b"ping")
    });
    assert!(log
        .borrow()
        .iter()
        .any(|(i, s, payload)| *i == id && *s == Status::Good && payload == b"ping"));

    drop(peer_stream);

    run_until(&mut event_loop, Duration::from_secs(2), || {
        log.borrow()
            .iter()
            .any(|(i, s, _)| *i == id && *s == Status::ConnectionClosed)
    });
    assert!(log
        .borrow()
        .iter()
        .any(|(i, s, _)| *i == id && *s == Status::ConnectionClosed));

    // The final close is strictly the last event observed for this id.
    let entries = log.borrow();
    let last = entries.iter().filter(|(i, _, _)| *i == id).last().unwrap();
    assert_eq!(last.1, Status::ConnectionClosed);
}

#[test]
fn send_after_close_is_connection_closed_and_close_is_idempotent() {
    let manager = make_logging_manager("tcp", Rc::new(RefCell::new(Vec::new())));

    let peer_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let peer_addr = peer_listener.local_addr().unwrap();

    let mut event_loop = EventLoop::new().unwrap();
    event_loop
        .register_event_source("tcp", Box::new(manager))
        .unwrap();
    event_loop.start().unwrap();

    let id = manager_mut(&mut event_loop, "tcp")
        .open_connection(&peer_addr.ip().to_string(), peer_addr.port())
        .unwrap();
    let (_peer_stream, _) = peer_listener.accept().unwrap();

    // Give the outbound connect a few cycles to complete (Established) before
    // exercising close/send-after-close.
    for _ in 0..10 {
        event_loop.run(Some(Duration::from_millis(20))).unwrap();
    }

    let manager = manager_mut(&mut event_loop, "tcp");
    manager.close_connection(id).unwrap();

    let allocator = BufferAllocator::new();
    let err = manager
        .send_with_connection(id, allocator.alloc(b"too late"))
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));

    // Still Closing until on_tick runs: a second close attempt reports the
    // trap state, not NotFound.
    assert!(matches!(
        manager.close_connection(id),
        Err(Error::InvalidState(_))
    ));

    event_loop.run(Some(Duration::from_millis(20))).unwrap();

    // Once on_tick has released the record, the id is gone entirely.
    assert!(matches!(
        manager_mut(&mut event_loop, "tcp").close_connection(id),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn cyclic_timer_keeps_firing_across_many_dispatch_cycles() {
    let mut event_loop = EventLoop::new().unwrap();
    event_loop.start().unwrap();

    let fires = Rc::new(RefCell::new(0u32));
    let fires_clone = fires.clone();
    event_loop
        .add_cyclic(
            Duration::from_millis(10),
            None,
            revent::TimerPolicy::CurrentTime,
            Box::new(move |_| *fires_clone.borrow_mut() += 1),
        )
        .unwrap();

    run_until(&mut event_loop, Duration::from_millis(500), || {
        *fires.borrow() >= 5
    });

    assert!(*fires.borrow() >= 5, "expected at least 5 firings, got {}", *fires.borrow());
}

#[test]
fn loopback_echo_self_connect_exactly_two_accepts_send_and_mutual_close() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut manager = make_logging_manager("tcp", log.clone());
    manager.configure(listen_config(17_884));

    let mut event_loop = EventLoop::new().unwrap();
    event_loop
        .register_event_source("tcp", Box::new(manager))
        .unwrap();
    event_loop.start().unwrap();
    event_loop.run(Some(Duration::from_millis(10))).unwrap();

    let client_id = manager_mut(&mut event_loop, "tcp")
        .open_connection("127.0.0.1", 17_884)
        .unwrap();
    assert!(
        !format!("{client_id:?}").ends_with("(0)"),
        "connection ids start at 1, never 0"
    );

    fn good_empty_ids(log: &[(ConnectionId, Status, Vec<u8>)]) -> Vec<ConnectionId> {
        log.iter()
            .filter(|(_, s, payload)| *s == Status::Good && payload.is_empty())
            .map(|(id, _, _)| *id)
            .collect()
    }

    run_until(&mut event_loop, Duration::from_secs(2), || {
        good_empty_ids(&log.borrow()).len() >= 2
    });

    let accepted_ids = good_empty_ids(&log.borrow());
    assert_eq!(
        accepted_ids.len(),
        2,
        "exactly two GOOD+empty callbacks: the accept side and the client side"
    );
    assert!(accepted_ids.contains(&client_id));
    let peer_id = *accepted_ids.iter().find(|id| **id != client_id).unwrap();

    let allocator = BufferAllocator::new();
    manager_mut(&mut event_loop, "tcp")
        .send_with_connection(client_id, allocator.alloc(b"open62541"))
        .unwrap();

    run_until(&mut event_loop, Duration::from_secs(2), || {
        log.borrow()
            .iter()
            .any(|(id, s, payload)| *id == peer_id && *s == Status::Good && payload == b"open62541")
    });
    assert!(log.borrow().iter().any(
        |(id, s, payload)| *id == peer_id && *s == Status::Good && payload == b"open62541"
    ));

    manager_mut(&mut event_loop, "tcp")
        .close_connection(client_id)
        .unwrap();

    run_until(&mut event_loop, Duration::from_secs(2), || {
        let entries = log.borrow();
        let client_closed = entries
            .iter()
            .any(|(id, s, _)| *id == client_id && *s == Status::ConnectionClosed);
        let peer_closed = entries
            .iter()
            .any(|(id, s, _)| *id == peer_id && *s == Status::ConnectionClosed);
        client_closed && peer_closed
    });

    let entries = log.borrow();
    assert!(entries
        .iter()
        .any(|(id, s, _)| *id == client_id && *s == Status::ConnectionClosed));
    assert!(entries
        .iter()
        .any(|(id, s, _)| *id == peer_id && *s == Status::ConnectionClosed));
}

#[test]
fn reentrant_run_from_inside_a_callback_is_rejected_and_outer_cycle_completes() {
    // A connection callback has no back-pointer to its owning loop by design
    // (the Registry hands sources a non-owning slot, not a raw pointer back
    // to the loop) — there is no safe API surface for a callback to reach
    // `run`. To drive a genuine reentrant call the way the invariant
    // describes ("install a callback that invokes run"), this test stashes
    // a raw pointer to the loop once it exists on the stack and
    // dereferences it, unsafely, solely to make that one nested call.
    let log = Rc::new(RefCell::new(Vec::new()));
    let loop_ptr: Rc<RefCell<Option<*mut EventLoop>>> = Rc::new(RefCell::new(None));
    let inner_result: Rc<RefCell<Option<Result<(), Error>>>> = Rc::new(RefCell::new(None));

    let cb_log = log.clone();
    let cb_loop_ptr = loop_ptr.clone();
    let cb_inner_result = inner_result.clone();
    let callback = Box::new(move |event: ConnectionEvent, _ctx: &mut Box<dyn Any>| {
        cb_log
            .borrow_mut()
            .push((event.id, event.status, event.payload.to_vec()));

        let already_tried = cb_inner_result.borrow().is_some();
        if event.status == Status::Good && event.payload.is_empty() && !already_tried {
            if let Some(ptr) = *cb_loop_ptr.borrow() {
                let reentered = unsafe { &mut *ptr };
                *cb_inner_result.borrow_mut() = Some(reentered.run(Some(Duration::ZERO)).map(|_| ()));
            }
        }
    });

    let mut manager = TcpConnectionManager::new("tcp", callback, Box::new(|| Box::new(())));
    manager.configure(listen_config(17_885));

    let mut event_loop = EventLoop::new().unwrap();
    event_loop
        .register_event_source("tcp", Box::new(manager))
        .unwrap();
    event_loop.start().unwrap();

    *loop_ptr.borrow_mut() = Some(&mut event_loop as *mut EventLoop);

    let mut client = StdTcpStream::connect("127.0.0.1:17885").unwrap();
    client.write_all(b"x").unwrap();

    run_until(&mut event_loop, Duration::from_secs(2), || {
        inner_result.borrow().is_some()
    });

    assert!(
        matches!(inner_result.borrow().as_ref().unwrap(), Err(Error::Internal(_))),
        "a callback-triggered nested run must fail with Internal"
    );

    // The outer dispatch cycle that hosted the reentrant attempt still ran
    // the accept callback to completion and recorded it normally.
    assert!(log
        .borrow()
        .iter()
        .any(|(_, s, payload)| *s == Status::Good && payload.is_empty()));
}
