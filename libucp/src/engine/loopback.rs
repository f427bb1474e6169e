//! An in-process transport engine.
//!
//! Every connection lives inside one engine: a listener is an entry in a port table, and connecting to it creates a
//! linked pair of connections, one handed to the listener's accept callback and one to the connecting side. Data is
//! moved by copying between the two.
//!
//! The engine follows the same completion rules as a native one:
//!
//! * Sends of at most `UCP_EAGER_LIMIT` bytes are copied out and complete during submission (the fast path).
//!   Larger sends complete only when the peer consumes them (rendezvous).
//! * Receives, connection attempts and shutdowns complete from inside `progress()`.
//! * Receives match inbound messages in FIFO order. A message larger than the posted receive fails that receive.
//!
//! With `UCP_EVENT_FD=y` (the default) the engine exposes a readiness descriptor backed by a unix socket pair, so it
//! can be driven in notification mode.

use crate::buffer::BufferDesc;
use crate::config::{parse_flag, parse_size, resolve_options, ConfigMap};
use crate::engine::{
    AcceptCallback, Completion, ConnHandle, ConnInfo, ConnectCompletion, EngineFactory, ListenerHandle, OpToken,
    TransportEngine, Version,
};
use crate::error::{TransportError, UcpError};
use log::*;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::IpAddr;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;

pub const LOOPBACK_VERSION: Version = Version::new(1, 0, 0);

/// Comma separated transports to use. The loopback engine provides `loopback` and `self`; `all` selects any.
pub const OPT_TLS: &str = "UCP_TLS";
/// Largest send, in bytes, that completes during submission.
pub const OPT_EAGER_LIMIT: &str = "UCP_EAGER_LIMIT";
/// Whether to expose a readiness descriptor.
pub const OPT_EVENT_FD: &str = "UCP_EVENT_FD";
/// Whether endpoints report device memory support.
pub const OPT_DEVICE_MEMORY: &str = "UCP_DEVICE_MEMORY";

const FIRST_EPHEMERAL_PORT: u16 = 49152;
const AVAILABLE_TRANSPORTS: [&str; 2] = ["loopback", "self"];

pub fn default_options() -> ConfigMap {
    [(OPT_TLS, "loopback"), (OPT_EAGER_LIMIT, "8192"), (OPT_EVENT_FD, "y"), (OPT_DEVICE_MEMORY, "n")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Creates [`LoopbackEngine`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoopbackFactory;

impl EngineFactory for LoopbackFactory {
    fn version(&self) -> Version {
        LOOPBACK_VERSION
    }

    fn default_config(&self) -> ConfigMap {
        resolve_options(&default_options(), &ConfigMap::new(), env_lookup).unwrap_or_else(|_| default_options())
    }

    fn create(&self, options: &ConfigMap) -> Result<Box<dyn TransportEngine>, UcpError> {
        let config = resolve_options(&default_options(), options, env_lookup)?;
        Ok(Box::new(LoopbackEngine::new(config)?))
    }
}

struct Settings {
    eager_limit: usize,
    event_fd: bool,
    device_memory: bool,
}

impl Settings {
    fn from_config(config: &ConfigMap) -> Result<Self, UcpError> {
        let value = |key: &str| config.get(key).map(String::as_str).unwrap_or_default();
        let tls = value(OPT_TLS);
        let usable = tls
            .split(',')
            .map(str::trim)
            .any(|t| t.eq_ignore_ascii_case("all") || AVAILABLE_TRANSPORTS.contains(&t.to_ascii_lowercase().as_str()));
        if !usable {
            return Err(UcpError::config(format!(
                "None of the requested transports ({tls}) are available. Available: {}",
                AVAILABLE_TRANSPORTS.join(", ")
            )));
        }
        Ok(Settings {
            eager_limit: parse_size(OPT_EAGER_LIMIT, value(OPT_EAGER_LIMIT))?,
            event_fd: parse_flag(OPT_EVENT_FD, value(OPT_EVENT_FD))?,
            device_memory: parse_flag(OPT_DEVICE_MEMORY, value(OPT_DEVICE_MEMORY))?,
        })
    }
}

struct Notifier {
    tx: UnixStream,
    rx: UnixStream,
    signalled: Cell<bool>,
}

impl Notifier {
    fn new() -> std::io::Result<Self> {
        let (tx, rx) = UnixStream::pair()?;
        tx.set_nonblocking(true)?;
        rx.set_nonblocking(true)?;
        Ok(Self { tx, rx, signalled: Cell::new(false) })
    }

    fn signal(&self) {
        if self.signalled.replace(true) {
            return;
        }
        if let Err(err) = (&self.tx).write(&[1]) {
            if err.kind() != ErrorKind::WouldBlock {
                warn!("Could not signal the readiness descriptor. {err}");
            }
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.rx).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
        self.signalled.set(false);
    }
}

struct LoopListener {
    port: u16,
    on_accept: AcceptCallback,
}

struct ConnectRequest {
    token: OpToken,
    address: String,
    port: u16,
    on_complete: ConnectCompletion,
}

struct ShutdownRequest {
    token: OpToken,
    conn: ConnHandle,
    on_complete: Completion,
}

struct PostedRecv {
    token: OpToken,
    buffer: BufferDesc,
    on_complete: Completion,
}

struct Message {
    payload: Vec<u8>,
    /// Set for rendezvous sends, which complete when the message is consumed.
    sender: Option<(OpToken, Completion)>,
}

struct Conn {
    uid: u64,
    peer: Option<ConnHandle>,
    origin: String,
    inbox: VecDeque<Message>,
    posted: VecDeque<PostedRecv>,
    /// Why the peer can no longer send to us, once it signalled shutdown or closed.
    remote_gone: Option<&'static str>,
}

impl Conn {
    fn new(uid: u64, peer: ConnHandle, origin: String) -> Self {
        Self { uid, peer: Some(peer), origin, inbox: VecDeque::new(), posted: VecDeque::new(), remote_gone: None }
    }
}

type Deferred = Box<dyn FnOnce()>;
type Immediate = Option<(Completion, Result<(), TransportError>)>;

#[derive(Default)]
struct State {
    destroyed: bool,
    next_id: u64,
    next_port: u16,
    listeners: HashMap<ListenerHandle, LoopListener>,
    ports: HashMap<u16, ListenerHandle>,
    conns: HashMap<ConnHandle, Conn>,
    connects: VecDeque<ConnectRequest>,
    shutdowns: VecDeque<ShutdownRequest>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ephemeral_port(&mut self) -> Result<u16, UcpError> {
        let span = u16::MAX - FIRST_EPHEMERAL_PORT + 1;
        let mut candidate = self.next_port.max(FIRST_EPHEMERAL_PORT);
        for _ in 0..span {
            let port = candidate;
            candidate = if candidate == u16::MAX { FIRST_EPHEMERAL_PORT } else { candidate + 1 };
            if !self.ports.contains_key(&port) {
                self.next_port = candidate;
                return Ok(port);
            }
        }
        Err(UcpError::bind("No unused port left"))
    }

    fn has_work(&self) -> bool {
        !self.connects.is_empty()
            || !self.shutdowns.is_empty()
            || self.conns.values().any(|c| !c.posted.is_empty() && (!c.inbox.is_empty() || c.remote_gone.is_some()))
    }

    fn establish_connections(&mut self, deferred: &mut Vec<Deferred>) {
        while let Some(req) = self.connects.pop_front() {
            let ConnectRequest { address, port, on_complete, .. } = req;
            if !is_local_address(&address) {
                let err = TransportError::new(format!("Host {address} is unreachable from the loopback transport"));
                deferred.push(Box::new(move || on_complete(Err(err))));
                continue;
            }
            let on_accept = self.ports.get(&port).and_then(|h| self.listeners.get(h)).map(|l| Rc::clone(&l.on_accept));
            let Some(on_accept) = on_accept else {
                let err = TransportError::new(format!("Connection refused. Nothing is listening on port {port}"));
                deferred.push(Box::new(move || on_complete(Err(err))));
                continue;
            };
            let client = ConnHandle(self.next_id());
            let server = ConnHandle(self.next_id());
            let (client_uid, server_uid) = (self.next_id(), self.next_id());
            self.conns.insert(client, Conn::new(client_uid, server, format!("connected to {address}:{port}")));
            self.conns.insert(server, Conn::new(server_uid, client, format!("accepted on port {port}")));
            trace!("Loopback connection established on port {port}: {client:?} <-> {server:?}");
            deferred.push(Box::new(move || on_accept(server)));
            deferred.push(Box::new(move || on_complete(Ok(client))));
        }
    }

    fn process_shutdowns(&mut self, deferred: &mut Vec<Deferred>) {
        while let Some(ShutdownRequest { conn, on_complete, .. }) = self.shutdowns.pop_front() {
            let result = match self.conns.get(&conn) {
                Some(c) => {
                    if let Some(peer) = c.peer.and_then(|p| self.conns.get_mut(&p)) {
                        peer.remote_gone.get_or_insert("Remote peer signalled shutdown");
                    }
                    Ok(())
                }
                None => Err(TransportError::new("Endpoint closed")),
            };
            deferred.push(Box::new(move || on_complete(result)));
        }
    }

    fn match_messages(&mut self, deferred: &mut Vec<Deferred>) {
        for conn in self.conns.values_mut() {
            while !conn.posted.is_empty() && !conn.inbox.is_empty() {
                let (Some(recv), Some(msg)) = (conn.posted.pop_front(), conn.inbox.pop_front()) else {
                    break;
                };
                let result = if msg.payload.len() > recv.buffer.len() {
                    Err(TransportError::new(format!(
                        "Message truncated. {} bytes arrived for a {} byte receive",
                        msg.payload.len(),
                        recv.buffer.len()
                    )))
                } else {
                    // SAFETY: the receive is still posted, so its buffer is valid and exclusively ours.
                    let dest = unsafe { recv.buffer.as_mut_slice() };
                    dest[..msg.payload.len()].copy_from_slice(&msg.payload);
                    Ok(())
                };
                if let Some((_, on_sent)) = msg.sender {
                    let result = result.clone();
                    deferred.push(Box::new(move || on_sent(result)));
                }
                let on_complete = recv.on_complete;
                deferred.push(Box::new(move || on_complete(result)));
            }
            if let Some(reason) = conn.remote_gone {
                if conn.inbox.is_empty() {
                    for recv in conn.posted.drain(..) {
                        let on_complete = recv.on_complete;
                        deferred.push(Box::new(move || on_complete(Err(TransportError::connection_lost(reason)))));
                    }
                }
            }
        }
    }

    fn remove_op(&mut self, op: OpToken) -> Option<Box<dyn Any>> {
        if let Some(i) = self.connects.iter().position(|r| r.token == op) {
            return self.connects.remove(i).map(|r| Box::new(r) as Box<dyn Any>);
        }
        if let Some(i) = self.shutdowns.iter().position(|r| r.token == op) {
            return self.shutdowns.remove(i).map(|r| Box::new(r) as Box<dyn Any>);
        }
        for conn in self.conns.values_mut() {
            if let Some(i) = conn.posted.iter().position(|r| r.token == op) {
                return conn.posted.remove(i).map(|r| Box::new(r) as Box<dyn Any>);
            }
            if let Some(i) = conn.inbox.iter().position(|m| matches!(&m.sender, Some((t, _)) if *t == op)) {
                return conn.inbox.remove(i).map(|m| Box::new(m) as Box<dyn Any>);
            }
        }
        None
    }
}

fn is_local_address(address: &str) -> bool {
    address.eq_ignore_ascii_case("localhost")
        || address.parse::<IpAddr>().map(|ip| ip.is_loopback() || ip.is_unspecified()).unwrap_or(false)
}

/// The in-process transport engine. Not shareable across threads.
pub struct LoopbackEngine {
    config: ConfigMap,
    settings: Settings,
    notifier: Option<Notifier>,
    state: RefCell<State>,
}

impl LoopbackEngine {
    /// Creates an engine from a fully resolved configuration.
    pub fn new(config: ConfigMap) -> Result<Self, UcpError> {
        let settings = Settings::from_config(&config)?;
        let notifier = if settings.event_fd { Some(Notifier::new()?) } else { None };
        debug!(
            "Loopback engine created. Eager limit {} bytes, event fd {}, device memory {}",
            settings.eager_limit, settings.event_fd, settings.device_memory
        );
        Ok(Self { config, settings, notifier, state: RefCell::new(State::default()) })
    }

    fn notify(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.signal();
        }
    }

    fn complete_now(&self, immediate: Immediate) {
        if let Some((on_complete, result)) = immediate {
            on_complete(result);
        }
    }
}

impl TransportEngine for LoopbackEngine {
    fn version(&self) -> Version {
        LOOPBACK_VERSION
    }

    fn config(&self) -> ConfigMap {
        self.config.clone()
    }

    fn worker_handle(&self) -> usize {
        self as *const Self as usize
    }

    fn progress(&self) -> bool {
        let deferred = {
            let mut state = self.state.borrow_mut();
            if state.destroyed {
                return false;
            }
            let mut deferred = Vec::new();
            state.establish_connections(&mut deferred);
            state.process_shutdowns(&mut deferred);
            state.match_messages(&mut deferred);
            deferred
        };
        let progressed = !deferred.is_empty();
        for callback in deferred {
            callback();
        }
        progressed
    }

    fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        self.notifier.as_ref().map(|n| n.rx.as_fd())
    }

    fn arm(&self) -> bool {
        if let Some(notifier) = &self.notifier {
            notifier.drain();
        }
        !self.state.borrow().has_work()
    }

    fn create_listener(&self, port: Option<u16>, on_accept: AcceptCallback) -> Result<ListenerHandle, UcpError> {
        let mut state = self.state.borrow_mut();
        if state.destroyed {
            return Err(UcpError::bind("The transport engine has been destroyed"));
        }
        let port = match port {
            None | Some(0) => state.ephemeral_port()?,
            Some(p) if state.ports.contains_key(&p) => {
                return Err(UcpError::bind(format!("Port {p} is already in use")));
            }
            Some(p) => p,
        };
        let handle = ListenerHandle(state.next_id());
        state.listeners.insert(handle, LoopListener { port, on_accept });
        state.ports.insert(port, handle);
        debug!("Loopback listener {handle:?} bound to port {port}");
        Ok(handle)
    }

    fn listener_port(&self, listener: ListenerHandle) -> Option<u16> {
        self.state.borrow().listeners.get(&listener).map(|l| l.port)
    }

    fn destroy_listener(&self, listener: ListenerHandle) {
        let removed = {
            let mut state = self.state.borrow_mut();
            let removed = state.listeners.remove(&listener);
            if let Some(l) = &removed {
                state.ports.remove(&l.port);
            }
            removed
        };
        // The accept callback may own arbitrary user state, so it is dropped outside the borrow.
        drop(removed);
    }

    fn connect(&self, address: &str, port: u16, on_complete: ConnectCompletion) -> OpToken {
        let (token, refused) = {
            let mut state = self.state.borrow_mut();
            let token = state.next_id();
            if state.destroyed {
                (token, Some(on_complete))
            } else {
                state.connects.push_back(ConnectRequest { token, address: address.to_string(), port, on_complete });
                (token, None)
            }
        };
        match refused {
            Some(on_complete) => on_complete(Err(TransportError::new("The transport engine has been destroyed"))),
            None => self.notify(),
        }
        token
    }

    unsafe fn send(&self, conn: ConnHandle, buffer: BufferDesc, on_complete: Completion) -> OpToken {
        let payload = buffer.as_slice().to_vec();
        let (token, immediate) = {
            let mut state = self.state.borrow_mut();
            let token = state.next_id();
            let target = match state.conns.get(&conn) {
                _ if state.destroyed => Err(TransportError::new("The transport engine has been destroyed")),
                None => Err(TransportError::new("Endpoint closed")),
                Some(c) => match (c.remote_gone, c.peer) {
                    (Some(reason), _) => Err(TransportError::connection_lost(reason)),
                    (None, None) => Err(TransportError::connection_lost("Remote peer closed the connection")),
                    (None, Some(peer)) => Ok(peer),
                },
            };
            let immediate = match target.map(|peer| state.conns.get_mut(&peer)) {
                Err(err) => Some((on_complete, Err(err))),
                Ok(None) => Some((on_complete, Err(TransportError::connection_lost("Remote peer closed the connection")))),
                Ok(Some(peer)) if payload.len() <= self.settings.eager_limit => {
                    peer.inbox.push_back(Message { payload, sender: None });
                    Some((on_complete, Ok(())))
                }
                Ok(Some(peer)) => {
                    peer.inbox.push_back(Message { payload, sender: Some((token, on_complete)) });
                    None
                }
            };
            (token, immediate)
        };
        self.notify();
        self.complete_now(immediate);
        token
    }

    unsafe fn recv(&self, conn: ConnHandle, buffer: BufferDesc, on_complete: Completion) -> OpToken {
        let (token, immediate) = {
            let mut state = self.state.borrow_mut();
            let token = state.next_id();
            let destroyed = state.destroyed;
            let immediate = match state.conns.get_mut(&conn) {
                _ if destroyed => Some((on_complete, Err(TransportError::new("The transport engine has been destroyed")))),
                None => Some((on_complete, Err(TransportError::new("Endpoint closed")))),
                Some(c) => {
                    c.posted.push_back(PostedRecv { token, buffer, on_complete });
                    None
                }
            };
            (token, immediate)
        };
        self.notify();
        self.complete_now(immediate);
        token
    }

    fn shutdown(&self, conn: ConnHandle, on_complete: Completion) -> OpToken {
        let (token, immediate) = {
            let mut state = self.state.borrow_mut();
            let token = state.next_id();
            let immediate = if state.conns.contains_key(&conn) && !state.destroyed {
                state.shutdowns.push_back(ShutdownRequest { token, conn, on_complete });
                None
            } else {
                Some((on_complete, Err(TransportError::new("Endpoint closed"))))
            };
            (token, immediate)
        };
        self.notify();
        self.complete_now(immediate);
        token
    }

    fn cancel(&self, op: OpToken) {
        let cancelled = self.state.borrow_mut().remove_op(op);
        if cancelled.is_some() {
            trace!("Loopback operation {op} cancelled");
        }
    }

    fn close(&self, conn: ConnHandle) {
        let failed = {
            let mut state = self.state.borrow_mut();
            let Some(closed) = state.conns.remove(&conn) else {
                return;
            };
            let closed_err = TransportError::new("Endpoint closed");
            let lost_err = TransportError::connection_lost("Remote peer closed the connection");
            let mut failed: Vec<(Completion, TransportError)> = Vec::new();
            failed.extend(closed.posted.into_iter().map(|r| (r.on_complete, closed_err.clone())));
            // Rendezvous sends from the peer that were waiting for us to consume them.
            failed.extend(closed.inbox.into_iter().filter_map(|m| m.sender).map(|(_, cb)| (cb, lost_err.clone())));
            let (ours, others): (VecDeque<_>, VecDeque<_>) =
                std::mem::take(&mut state.shutdowns).into_iter().partition(|r| r.conn == conn);
            state.shutdowns = others;
            failed.extend(ours.into_iter().map(|r| (r.on_complete, closed_err.clone())));
            if let Some(peer) = closed.peer.and_then(|p| state.conns.get_mut(&p)) {
                peer.peer = None;
                peer.remote_gone.get_or_insert("Remote peer closed the connection");
                // Our own rendezvous sends will never be consumed now.
                for msg in std::mem::take(&mut peer.inbox) {
                    match msg.sender {
                        Some((_, cb)) => failed.push((cb, closed_err.clone())),
                        None => peer.inbox.push_back(msg),
                    }
                }
            }
            trace!("Loopback connection {conn:?} closed with {} operations outstanding", failed.len());
            failed
        };
        for (on_complete, err) in failed {
            on_complete(Err(err));
        }
    }

    fn conn_info(&self, conn: ConnHandle) -> Option<ConnInfo> {
        let state = self.state.borrow();
        let c = state.conns.get(&conn)?;
        let peer_uid = c.peer.and_then(|p| state.conns.get(&p)).map(|p| p.uid);
        let peer = peer_uid.map(|uid| format!("{uid:#x}")).unwrap_or_else(|| "none".to_string());
        Some(ConnInfo {
            uid: c.uid,
            device_memory: self.settings.device_memory,
            description: format!(
                "loopback endpoint {:#x} {}, peer {peer}, eager limit {} bytes",
                c.uid, c.origin, self.settings.eager_limit
            ),
        })
    }

    fn destroy(&self) {
        let released = {
            let mut state = self.state.borrow_mut();
            if state.destroyed {
                return;
            }
            let released = std::mem::take(&mut *state);
            state.destroyed = true;
            released
        };
        if !released.conns.is_empty() || !released.listeners.is_empty() {
            warn!(
                "Loopback engine destroyed with {} connections and {} listeners still open",
                released.conns.len(),
                released.listeners.len()
            );
        }
        drop(released);
        debug!("Loopback engine destroyed");
    }
}
