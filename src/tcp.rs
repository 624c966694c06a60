use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr};

use dns_lookup::lookup_host;
use mio::net::{TcpListener, TcpStream};
use mio::Registry as MioRegistry;

use crate::buffer::{BufferAllocator, RecvSlice, SendBuffer};
use crate::error::{Error, Status};
use crate::param::{ParamKey, ParamMap, ParamValue};
use crate::poller::{Interest, Poller, Readiness};
use crate::source::{make_token, EventSource, SourceSlot, SourceState, Tag};

const DEFAULT_RECV_BUFSIZE: usize = 16384;

/// A stable id for a Connection, unique for the Connection Manager's
/// lifetime. Distinct from the raw socket fd so ids stay valid through
/// close/FD-reuse races.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Listening,
    Accepted,
    OutboundConnecting,
    Established,
    Closing,
}

/// One event delivered to the connection callback: status, a borrowed
/// payload (empty outside a receive), and any reported parameters (e.g.
/// `remote-hostname` on accept).
pub struct ConnectionEvent<'a> {
    pub id: ConnectionId,
    pub status: Status,
    pub payload: &'a [u8],
    pub params: &'a ParamMap,
}

/// The single callback a `TcpConnectionManager` dispatches every connection
/// event through, plus the per-connection application context, read back
/// and potentially rewritten on every invocation (the callback is free to
/// replace the boxed context to track per-connection state).
pub type ConnectionCallback = Box<dyn FnMut(ConnectionEvent, &mut Box<dyn Any>)>;

/// Produces the context installed on a freshly accepted or connected
/// socket.
pub type ContextFactory = Box<dyn Fn() -> Box<dyn Any>>;

enum Socket {
    Listener(TcpListener),
    Stream(TcpStream),
}

struct ConnectionEntry {
    id: ConnectionId,
    kind: ConnectionKind,
    socket: Socket,
    context: Box<dyn Any>,
    write_queue: VecDeque<SendBuffer>,
    write_interest: bool,
    accept_paused: bool,
}

/// Concrete Event Source that owns listening endpoints and live connections,
/// translating Poller readiness into application callbacks.
pub struct TcpConnectionManager {
    name: String,
    state: SourceState,
    config: ParamMap,
    slot: Option<SourceSlot>,
    registry: Option<MioRegistry>,
    next_id: u64,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    recv_bufsize: usize,
    allocator: BufferAllocator,
    callback: ConnectionCallback,
    make_context: ContextFactory,
    pending_closes: VecDeque<ConnectionId>,
}

impl TcpConnectionManager {
    pub fn new(name: impl Into<String>, callback: ConnectionCallback, make_context: ContextFactory) -> Self {
        TcpConnectionManager {
            name: name.into(),
            state: SourceState::Fresh,
            config: ParamMap::new(),
            slot: None,
            registry: None,
            next_id: 1,
            connections: HashMap::new(),
            recv_bufsize: DEFAULT_RECV_BUFSIZE,
            allocator: BufferAllocator::new(),
            callback,
            make_context,
            pending_closes: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the configuration parameters read at `start` (`listen-port`,
    /// `listen-hostnames`, `recv-bufsize`). Must be called before the source
    /// is started.
    pub fn configure(&mut self, config: ParamMap) {
        self.config = config;
    }

    pub fn buffer_allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    fn alloc_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        id
    }

    fn registry(&self) -> Result<&MioRegistry, Error> {
        self.registry
            .as_ref()
            .ok_or_else(|| Error::InvalidState(format!("{} is not started", self.name)))
    }

    fn token_for(&self, id: ConnectionId) -> Result<mio::Token, Error> {
        let slot = self
            .slot
            .ok_or_else(|| Error::InvalidState(format!("{} is not started", self.name)))?;
        Ok(make_token(slot, id.0))
    }

    fn parse_bind_addr(host: &str, port: u16) -> Result<SocketAddr, Error> {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid listen hostname: {host}")))?;
        Ok(SocketAddr::new(ip, port))
    }

    fn bind_listener(&mut self, host: &str, port: u16) -> Result<(), Error> {
        let addr = Self::parse_bind_addr(host, port)?;
        let mut listener = TcpListener::bind(addr)
            .map_err(|e| Error::OutOfResources(format!("bind {addr} failed: {e}")))?;

        let id = self.alloc_id();
        let token = self.token_for(id)?;

        self.registry()?
            .register(&mut listener, token, Interest::Read.to_mio())
            .map_err(|e| Error::OutOfResources(format!("register listener failed: {e}")))?;

        self.connections.insert(
            id,
            ConnectionEntry {
                id,
                kind: ConnectionKind::Listening,
                socket: Socket::Listener(listener),
                context: Box::new(()),
                write_queue: VecDeque::new(),
                write_interest: false,
                accept_paused: false,
            },
        );

        Ok(())
    }

    fn emit(&mut self, id: ConnectionId, status: Status, payload: &[u8], params: &ParamMap) {
        if let Some(conn) = self.connections.get_mut(&id) {
            let event = ConnectionEvent {
                id,
                status,
                payload,
                params,
            };
            (self.callback)(event, &mut conn.context);
        }
    }

    /// Resolves `hostname`, opens a non-blocking socket, and begins
    /// `connect`. Returns synchronously once the kernel has accepted the
    /// connection request; success/failure of the TCP handshake itself is
    /// reported asynchronously through the callback.
    pub fn open_connection(&mut self, hostname: &str, port: u16) -> Result<ConnectionId, Error> {
        let ip = resolve_first(hostname)
            .map_err(|e| Error::ConnectionRejected(format!("resolve {hostname} failed: {e}")))?;
        let addr = SocketAddr::new(ip, port);

        let mut stream = TcpStream::connect(addr)
            .map_err(|e| Error::ConnectionRejected(format!("connect {addr} failed: {e}")))?;

        let id = self.alloc_id();
        let token = self.token_for(id)?;

        self.registry()?
            .register(&mut stream, token, Interest::Write.to_mio())
            .map_err(|e| Error::OutOfResources(format!("register outbound socket failed: {e}")))?;

        self.connections.insert(
            id,
            ConnectionEntry {
                id,
                kind: ConnectionKind::OutboundConnecting,
                socket: Socket::Stream(stream),
                context: (self.make_context)(),
                write_queue: VecDeque::new(),
                write_interest: true,
                accept_paused: false,
            },
        );

        Ok(id)
    }

    /// Writes `buf` to connection `id`. The buffer's memory is always
    /// released by the time this call returns, whether the payload was
    /// fully flushed synchronously or queued for later.
    pub fn send_with_connection(&mut self, id: ConnectionId, mut buf: SendBuffer) -> Result<(), Error> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("connection {id:?}")))?;

        if conn.kind == ConnectionKind::Closing {
            return Err(Error::ConnectionClosed);
        }

        let stream = match &mut conn.socket {
            Socket::Stream(s) => s,
            Socket::Listener(_) => {
                return Err(Error::InvalidState(format!(
                    "connection {id:?} is a listener, not a stream"
                )))
            }
        };

        if !conn.write_queue.is_empty() {
            conn.write_queue.push_back(buf);
            return Ok(());
        }

        match stream.write(buf.as_slice()) {
            Ok(n) if n == buf.len() => {}
            Ok(n) => {
                buf.split_sent(n);
                conn.write_queue.push_back(buf);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                conn.write_queue.push_back(buf);
            }
            Err(_) => {
                drop(buf);
                self.begin_close(id);
                return Err(Error::ConnectionClosed);
            }
        }

        if !self.connections[&id].write_queue.is_empty() {
            self.set_write_interest(id, true)?;
        }

        Ok(())
    }

    fn set_write_interest(&mut self, id: ConnectionId, enabled: bool) -> Result<(), Error> {
        let token = self.token_for(id)?;
        let registry = self.registry()?.try_clone().map_err(|e| {
            Error::OutOfResources(format!("registry clone failed: {e}"))
        })?;

        let conn = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("connection {id:?}")))?;

        let stream = match &mut conn.socket {
            Socket::Stream(s) => s,
            Socket::Listener(_) => return Ok(()),
        };

        let interest = if enabled {
            Interest::ReadWrite
        } else {
            Interest::Read
        };

        registry
            .reregister(stream, token, interest.to_mio())
            .map_err(|e| Error::OutOfResources(format!("reregister failed: {e}")))?;

        conn.write_interest = enabled;
        Ok(())
    }

    /// Closes connection `id`. Asynchronous: the final callback
    /// (status=ConnectionClosed) fires on a later `on_tick`, after which the
    /// Connection record is released.
    pub fn close_connection(&mut self, id: ConnectionId) -> Result<(), Error> {
        match self.connections.get(&id) {
            None => Err(Error::NotFound(format!("connection {id:?}"))),
            Some(conn) if conn.kind == ConnectionKind::Closing => {
                Err(Error::InvalidState(format!("connection {id:?} already closing")))
            }
            Some(conn) if conn.kind == ConnectionKind::Listening => {
                Err(Error::InvalidState(format!("connection {id:?} is a listener")))
            }
            Some(_) => {
                self.begin_close(id);
                Ok(())
            }
        }
    }

    /// Initiates the half-close/unregister/drain sequence for `id` and
    /// queues its final callback. Idempotent against an already-Closing
    /// connection.
    fn begin_close(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.kind == ConnectionKind::Closing {
            return;
        }

        conn.kind = ConnectionKind::Closing;
        // Draining a pending send buffer across a non-blocking socket has no
        // synchronous guarantee of delivery; this implementation discards
        // whatever has not already reached the kernel rather than blocking
        // to flush it.
        conn.write_queue.clear();

        if let Socket::Stream(stream) = &mut conn.socket {
            let _ = stream.shutdown(Shutdown::Write);
            if let Some(registry) = &self.registry {
                let _ = registry.deregister(stream);
            }
        }

        self.pending_closes.push_back(id);
    }

    fn close_listener(&mut self, id: ConnectionId) {
        if let Some(mut conn) = self.connections.remove(&id) {
            if let Socket::Listener(listener) = &mut conn.socket {
                if let Some(registry) = &self.registry {
                    let _ = registry.deregister(listener);
                }
            }
        }
    }

    fn accept_loop(&mut self, id: ConnectionId) {
        loop {
            let accepted = match self.connections.get_mut(&id) {
                Some(conn) => match &mut conn.socket {
                    Socket::Listener(listener) => listener.accept(),
                    Socket::Stream(_) => return,
                },
                None => return,
            };

            let (mut stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EMFILE/ENFILE and friends: back off accepting on this
                    // listener until some connection frees a descriptor.
                    log::warn!("{}: accept failed on listener {:?}: {e}", self.name, id);
                    if let Some(conn) = self.connections.get_mut(&id) {
                        if let Socket::Listener(listener) = &mut conn.socket {
                            if let Some(registry) = &self.registry {
                                let _ = registry.deregister(listener);
                            }
                        }
                        conn.accept_paused = true;
                    }
                    return;
                }
            };

            let _ = stream.set_nodelay(true);

            let new_id = self.alloc_id();
            let token = match self.token_for(new_id) {
                Ok(t) => t,
                Err(_) => continue,
            };

            if let Some(registry) = &self.registry {
                if registry
                    .register(&mut stream, token, Interest::Read.to_mio())
                    .is_err()
                {
                    continue;
                }
            }

            self.connections.insert(
                new_id,
                ConnectionEntry {
                    id: new_id,
                    kind: ConnectionKind::Accepted,
                    socket: Socket::Stream(stream),
                    context: (self.make_context)(),
                    write_queue: VecDeque::new(),
                    write_interest: false,
                    accept_paused: false,
                },
            );

            let mut params = ParamMap::new();
            params.set(
                ParamKey::reference("remote-hostname"),
                ParamValue::String(peer.to_string()),
            );

            self.emit(new_id, Status::Good, &[], &params);

            // The accept callback may have called close_connection(new_id),
            // which already moved it to Closing and deregistered the socket;
            // only promote it to Established if it's still where accept left it.
            if let Some(conn) = self.connections.get_mut(&new_id) {
                if conn.kind == ConnectionKind::Accepted {
                    conn.kind = ConnectionKind::Established;
                }
            }
        }
    }

    fn handle_connect_ready(&mut self, id: ConnectionId) {
        let socket_error = match self.connections.get_mut(&id) {
            Some(conn) => match &mut conn.socket {
                Socket::Stream(stream) => stream.take_error(),
                Socket::Listener(_) => return,
            },
            None => return,
        };

        match socket_error {
            Ok(None) => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.kind = ConnectionKind::Established;
                }
                let _ = self.set_write_interest(id, false);
                let params = ParamMap::new();
                self.emit(id, Status::Good, &[], &params);
            }
            Ok(Some(e)) | Err(e) => {
                log::warn!("{}: outbound connect {:?} failed: {e}", self.name, id);
                if let Some(mut conn) = self.connections.remove(&id) {
                    let params = ParamMap::new();
                    let event = ConnectionEvent {
                        id,
                        status: Status::ConnectionRejected,
                        payload: &[],
                        params: &params,
                    };
                    (self.callback)(event, &mut conn.context);
                }
            }
        }
    }

    fn handle_write_ready(&mut self, id: ConnectionId) {
        loop {
            let conn = match self.connections.get_mut(&id) {
                Some(conn) => conn,
                None => return,
            };
            let Some(mut buf) = conn.write_queue.pop_front() else {
                break;
            };
            let stream = match &mut conn.socket {
                Socket::Stream(s) => s,
                Socket::Listener(_) => return,
            };

            match stream.write(buf.as_slice()) {
                Ok(n) if n == buf.len() => continue,
                Ok(n) => {
                    buf.split_sent(n);
                    conn.write_queue.push_front(buf);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    conn.write_queue.push_front(buf);
                    break;
                }
                Err(_) => {
                    self.begin_close(id);
                    return;
                }
            }
        }

        if self
            .connections
            .get(&id)
            .is_some_and(|c| c.write_queue.is_empty() && c.write_interest)
        {
            let _ = self.set_write_interest(id, false);
        }
    }

    /// Drains every byte available on this edge-triggered readiness event:
    /// `mio::Poll` only re-delivers Read readiness on a fresh edge, so a
    /// single `read()` can strand bytes still sitting in the kernel buffer
    /// (or miss a FIN that arrived right behind the last chunk of data).
    /// Reads in a loop until `WouldBlock`, `Ok(0)`, or a fatal error.
    fn handle_read_ready(&mut self, id: ConnectionId) {
        let mut scratch = self.allocator.alloc_recv_scratch(self.recv_bufsize);

        loop {
            let outcome = match self.connections.get_mut(&id) {
                Some(conn) => match &mut conn.socket {
                    Socket::Stream(stream) => stream.read(&mut scratch),
                    Socket::Listener(_) => return,
                },
                None => return,
            };

            match outcome {
                Ok(0) => {
                    self.begin_close(id);
                    return;
                }
                Ok(n) => {
                    let params = ParamMap::new();
                    let slice = RecvSlice::new(&scratch[..n]);
                    self.emit(id, Status::Good, slice.as_slice(), &params);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.begin_close(id);
                    return;
                }
            }
        }
    }
}

impl EventSource for TcpConnectionManager {
    fn tag(&self) -> Tag {
        Tag::ConnectionManager
    }

    fn state(&self) -> SourceState {
        self.state
    }

    fn start(&mut self, poller: &Poller, slot: SourceSlot) -> Result<(), Error> {
        self.slot = Some(slot);
        self.registry = Some(
            poller
                .registry()
                .try_clone()
                .map_err(|e| Error::OutOfResources(format!("registry clone failed: {e}")))?,
        );
        self.state = SourceState::Starting;

        if let Some(bufsize) = self
            .config
            .get_u16(&ParamKey::reference("recv-bufsize"))?
        {
            self.recv_bufsize = bufsize as usize;
        }

        if let Some(port) = self.config.get_u16(&ParamKey::reference("listen-port"))? {
            let hostnames = self
                .config
                .get_string_array(&ParamKey::reference("listen-hostnames"))?
                .unwrap_or_else(|| vec!["0.0.0.0".to_string()]);

            let mut bound = 0usize;
            for host in &hostnames {
                match self.bind_listener(host, port) {
                    Ok(()) => bound += 1,
                    Err(e) => log::warn!(
                        "{}: failed to bind listening endpoint {}:{}: {}",
                        self.name,
                        host,
                        port,
                        e
                    ),
                }
            }

            if bound == 0 {
                self.state = SourceState::Stopped;
                return Err(Error::OutOfResources(format!(
                    "{}: every listening endpoint failed to bind",
                    self.name
                )));
            }
        }

        self.state = SourceState::Started;
        Ok(())
    }

    fn stop(&mut self, _poller: &Poller) {
        self.state = SourceState::Stopping;

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            match self.connections.get(&id).map(|c| c.kind) {
                Some(ConnectionKind::Listening) => self.close_listener(id),
                Some(ConnectionKind::Closing) | None => {}
                Some(_) => self.begin_close(id),
            }
        }

        if self.connections.is_empty() && self.pending_closes.is_empty() {
            self.state = SourceState::Stopped;
        }
    }

    fn free(&mut self, _poller: &Poller) {
        self.connections.clear();
        self.pending_closes.clear();
        self.registry = None;
        self.slot = None;
    }

    fn on_poll_event(&mut self, _poller: &Poller, local_token: u64, readiness: Readiness) {
        let id = ConnectionId(local_token);

        let kind = match self.connections.get(&id) {
            Some(conn) => conn.kind,
            None => return,
        };

        match kind {
            ConnectionKind::Listening => self.accept_loop(id),
            ConnectionKind::OutboundConnecting => {
                if readiness.writable {
                    self.handle_connect_ready(id);
                }
            }
            ConnectionKind::Established | ConnectionKind::Accepted => {
                if readiness.writable {
                    self.handle_write_ready(id);
                }
                if readiness.readable {
                    self.handle_read_ready(id);
                }
            }
            ConnectionKind::Closing => {}
        }
    }

    fn on_tick(&mut self) {
        let closes: Vec<ConnectionId> = self.pending_closes.drain(..).collect();
        let mut freed_any = false;

        for id in closes {
            if let Some(mut conn) = self.connections.remove(&id) {
                let params = ParamMap::new();
                let event = ConnectionEvent {
                    id,
                    status: Status::ConnectionClosed,
                    payload: &[],
                    params: &params,
                };
                (self.callback)(event, &mut conn.context);
                freed_any = true;
            }
        }

        if freed_any {
            if let Some(registry) = self.registry.clone() {
                for conn in self.connections.values_mut() {
                    if conn.accept_paused {
                        if let Socket::Listener(listener) = &mut conn.socket {
                            let token = make_token(self.slot.unwrap(), conn.id.0);
                            if registry
                                .register(listener, token, Interest::Read.to_mio())
                                .is_ok()
                            {
                                conn.accept_paused = false;
                            }
                        }
                    }
                }
            }
        }

        if self.state == SourceState::Stopping
            && self.pending_closes.is_empty()
            && !self
                .connections
                .values()
                .any(|c| c.kind == ConnectionKind::Closing)
        {
            self.state = SourceState::Stopped;
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn resolve_first(hostname: &str) -> io::Result<IpAddr> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Ok(ip);
    }
    lookup_host(hostname)?
        .into_iter()
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"))
}
