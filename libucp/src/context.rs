//! The application context: sole owner of a transport engine.
//!
//! An [`ApplicationContext`] is a cheap, clonable handle. Every [`Endpoint`] and [`Listener`] created through it keeps a
//! counted back-reference and registers itself in the context's referent registry, so teardown can tell exactly what
//! is still holding the engine alive.
//!
//! Teardown ([`ApplicationContext::teardown`]) runs in a fixed order:
//!
//! 1. Disengage the progress driver.
//! 2. Drop the caller's reference.
//! 3. Check whether anything else still references the context.
//! 4. If so, enumerate the referents and fail with [`UcpError::ResourceLeak`]. The engine is destroyed later, when the
//!    last referent is released.
//!
//! Leak detection has to happen after step 2, otherwise the caller's own reference would always count as a leak.

use crate::config::{ConfigMap, ProgressMode};
use crate::endpoint::Endpoint;
use crate::engine::{AcceptCallback, Completion, ConnHandle, ConnectCompletion, EngineFactory, OpToken, TransportEngine};
use crate::error::UcpError;
use crate::listener::Listener;
use crate::pending::{PendingOp, PendingOps};
use crate::progress::ProgressDriver;
use futures::stream::{FuturesUnordered, StreamExt};
use log::*;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferentKind {
    Endpoint,
    Listener,
}

impl Display for ReferentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReferentKind::Endpoint => write!(f, "Endpoint"),
            ReferentKind::Listener => write!(f, "Listener"),
        }
    }
}

/// A live object holding a reference to a context.
#[derive(Clone, Debug)]
pub struct Referent {
    pub kind: ReferentKind,
    pub id: u64,
    pub description: String,
}

impl Display for Referent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} #{} ({})", self.kind, self.id, self.description)
    }
}

#[derive(Default)]
struct ReferentRegistry {
    next_id: Cell<u64>,
    entries: RefCell<BTreeMap<u64, Referent>>,
}

impl ReferentRegistry {
    fn register(&self, kind: ReferentKind, description: String) -> u64 {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        self.entries.borrow_mut().insert(id, Referent { kind, id, description });
        id
    }

    fn unregister(&self, id: u64) {
        self.entries.borrow_mut().remove(&id);
    }

    fn snapshot(&self) -> Vec<Referent> {
        self.entries.borrow().values().cloned().collect()
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Listener handlers that are still running. They advance whenever the context makes progress.
#[derive(Default)]
struct HandlerSet {
    incoming: RefCell<Vec<HandlerFuture>>,
    running: RefCell<FuturesUnordered<HandlerFuture>>,
}

impl HandlerSet {
    fn push(&self, handler: HandlerFuture) {
        self.incoming.borrow_mut().push(handler);
    }

    /// Polls the handlers that are ready to run. Returns `true` if any of them finished.
    ///
    /// A handler that drives progress itself re-enters here; that nested call does nothing.
    fn poll(&self, cx: &mut Context<'_>) -> bool {
        let Ok(mut running) = self.running.try_borrow_mut() else {
            return false;
        };
        let mut finished = false;
        loop {
            running.extend(self.incoming.borrow_mut().drain(..));
            match running.poll_next_unpin(cx) {
                Poll::Ready(Some(())) => finished = true,
                _ if self.incoming.borrow().is_empty() => break,
                _ => {}
            }
        }
        finished
    }

    fn len(&self) -> usize {
        let running = self.running.try_borrow().map(|r| r.len()).unwrap_or_default();
        running + self.incoming.borrow().len()
    }
}

pub(crate) struct ContextInner {
    engine: Rc<dyn TransportEngine>,
    ops: Rc<PendingOps<()>>,
    connects: Rc<PendingOps<ConnHandle>>,
    referents: ReferentRegistry,
    handlers: HandlerSet,
    driver: ProgressDriver,
}

impl ContextInner {
    pub fn engine(&self) -> &Rc<dyn TransportEngine> {
        &self.engine
    }

    /// Runs listener handlers on behalf of the task polled with `cx`.
    pub fn poll_handlers(&self, cx: &mut Context<'_>) -> bool {
        self.handlers.poll(cx)
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.driver.disengage();
        if !(self.ops.is_empty() && self.connects.is_empty()) {
            let pending = self.ops.len() + self.connects.len();
            warn!("Destroying the transport engine with {pending} operations still pending");
        }
        self.engine.destroy();
        debug!("Application context destroyed");
    }
}

/// Owner of a transport engine and factory for endpoints and listeners.
#[derive(Clone)]
pub struct ApplicationContext {
    inner: Rc<ContextInner>,
}

impl std::fmt::Debug for ApplicationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationContext").field("progress_mode", &self.progress_mode()).finish_non_exhaustive()
    }
}

impl ApplicationContext {
    /// Wraps an already created engine and starts the progress driver.
    ///
    /// `Polling` and `Notification` progress (and `Auto`, which resolves to one of them) spawn a local task, so the
    /// context must be created inside a [`tokio::task::LocalSet`]. Outside one, creation fails with
    /// [`UcpError::Config`]. `Manual` progress needs no runtime at all.
    pub fn new(engine: Box<dyn TransportEngine>, mode: ProgressMode) -> Result<Self, UcpError> {
        let engine: Rc<dyn TransportEngine> = Rc::from(engine);
        let driver = ProgressDriver::new(mode, engine.as_ref())?;
        let closer = Rc::downgrade(&engine);
        // A connection nobody will ever wrap in an endpoint must still be closed, or its peer never finds out.
        let connects = PendingOps::with_orphan_handler(move |conn: ConnHandle| {
            if let Some(engine) = closer.upgrade() {
                debug!("Closing connection {conn:?} from an abandoned connection attempt");
                engine.close(conn);
            }
        });
        let inner = Rc::new(ContextInner {
            engine,
            ops: Rc::new(PendingOps::new()),
            connects: Rc::new(connects),
            referents: ReferentRegistry::default(),
            handlers: HandlerSet::default(),
            driver,
        });
        inner.driver.engage(Rc::downgrade(&inner), inner.engine.as_ref())?;
        info!(
            "Application context created. Engine version {}, progress mode {}",
            inner.engine.version(),
            inner.driver.mode()
        );
        Ok(Self { inner })
    }

    /// Creates an engine from `factory` with the given explicit options, then wraps it.
    pub fn from_factory(factory: &dyn EngineFactory, options: &ConfigMap, mode: ProgressMode) -> Result<Self, UcpError> {
        let engine = factory.create(options)?;
        Self::new(engine, mode)
    }

    pub(crate) fn from_inner(inner: Rc<ContextInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn engine(&self) -> &Rc<dyn TransportEngine> {
        &self.inner.engine
    }

    pub(crate) fn register_referent(&self, kind: ReferentKind, description: String) -> u64 {
        self.inner.referents.register(kind, description)
    }

    pub(crate) fn unregister_referent(&self, id: u64) {
        self.inner.referents.unregister(id)
    }

    /// Submits a send, receive or shutdown and returns the suspended operation.
    pub(crate) fn submit<F>(&self, submit: F) -> PendingOp<()>
    where
        F: FnOnce(&dyn TransportEngine, Completion) -> OpToken,
    {
        let ops = &self.inner.ops;
        let (id, receiver) = ops.register();
        let token = submit(self.inner.engine.as_ref(), ops.callback(id));
        ops.set_token(id, token);
        self.inner.driver.wake();
        PendingOp::new(id, receiver, Rc::clone(ops), Rc::clone(&self.inner.engine))
    }

    /// Starts an accept service on `port` (an unused one if `None`).
    ///
    /// `handler` is called once per accepted connection with the new [`Endpoint`]. The future it returns is owned by the
    /// context and advances whenever the context makes progress, alongside every other handler. A slow handler never
    /// holds up the next accept, and closing the listener does not cancel handlers already running.
    pub fn create_listener<F, Fut>(&self, handler: F, port: Option<u16>) -> Result<Listener, UcpError>
    where
        F: Fn(Endpoint) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let ctx = self.downgrade();
        let on_accept: AcceptCallback = Rc::new(move |conn| {
            let Some(inner) = ctx.upgrade() else {
                warn!("Connection accepted after the context was torn down. Dropping it.");
                return;
            };
            let endpoint = Endpoint::new(ApplicationContext::from_inner(Rc::clone(&inner)), conn);
            debug!("Accepted connection {}", endpoint.uid());
            inner.handlers.push(Box::pin(handler(endpoint)));
            inner.driver.wake();
        });
        let handle = self.inner.engine.create_listener(port, on_accept)?;
        Ok(Listener::new(self.clone(), handle))
    }

    /// Connects to a listener at `address:port`. Suspends until the handshake completes.
    pub async fn create_endpoint(&self, address: &str, port: u16) -> Result<Endpoint, UcpError> {
        let connects = &self.inner.connects;
        let (id, receiver) = connects.register();
        let on_complete: ConnectCompletion = connects.callback(id);
        trace!("Connecting to {address}:{port}");
        let token = self.inner.engine.connect(address, port, on_complete);
        connects.set_token(id, token);
        self.inner.driver.wake();
        let pending = PendingOp::new(id, receiver, Rc::clone(connects), Rc::clone(&self.inner.engine));
        match pending.await {
            Ok(conn) => {
                let endpoint = Endpoint::new(self.clone(), conn);
                debug!("Connected to {address}:{port}. Endpoint {}", endpoint.uid());
                Ok(endpoint)
            }
            Err(err) => Err(UcpError::Connection { address: address.to_string(), port, reason: err.to_string() }),
        }
    }

    /// Advances all in-flight operations once, without blocking. Returns `true` if anything advanced.
    ///
    /// Without a background progress task this also runs the listener handlers that are ready. Otherwise the task
    /// runs them.
    pub fn progress(&self) -> bool {
        let advanced = self.inner.engine.progress();
        if self.inner.driver.is_engaged() {
            return advanced;
        }
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        self.inner.handlers.poll(&mut cx) || advanced
    }

    /// The effective engine configuration.
    pub fn config(&self) -> ConfigMap {
        self.inner.engine.config()
    }

    /// The native worker handle, as an address.
    pub fn worker_handle(&self) -> usize {
        self.inner.engine.worker_handle()
    }

    /// The progress mode in effect (never `Auto`).
    pub fn progress_mode(&self) -> ProgressMode {
        self.inner.driver.mode()
    }

    /// Whether a background progress task is running for this context.
    pub fn is_progress_engaged(&self) -> bool {
        self.inner.driver.is_engaged()
    }

    /// Endpoints and listeners currently holding this context.
    pub fn live_referents(&self) -> Vec<Referent> {
        self.inner.referents.snapshot()
    }

    /// Number of suspended operations awaiting completion.
    pub fn pending_operations(&self) -> usize {
        self.inner.ops.len() + self.inner.connects.len()
    }

    /// Number of listener handlers that have not finished yet.
    pub fn running_handlers(&self) -> usize {
        self.inner.handlers.len()
    }

    /// Tears the context down, failing with [`UcpError::ResourceLeak`] if anything still references it.
    ///
    /// On failure the engine stays alive until the last referent is released, and is destroyed then.
    pub fn teardown(self) -> Result<(), UcpError> {
        self.inner.driver.disengage();
        let weak = self.downgrade();
        drop(self);
        match weak.upgrade() {
            None => Ok(()),
            Some(inner) => {
                let report = leak_report(&inner);
                error!("{report}");
                Err(UcpError::ResourceLeak(report))
            }
        }
    }
}

/// Describes everything keeping `inner` alive.
pub(crate) fn leak_report(inner: &Rc<ContextInner>) -> String {
    let mut msg = String::from(
        "Trying to reset the transport but not all Endpoints and/or Listeners are closed. The following objects are still \
         referencing the application context:",
    );
    let referents = inner.referents.snapshot();
    for referent in &referents {
        msg.push_str(&format!("\n  {referent}"));
    }
    // One count belongs to the caller inspecting the context right now.
    let untracked = Rc::strong_count(inner).saturating_sub(referents.len() + 1);
    if untracked > 0 {
        msg.push_str(&format!("\n  {untracked} other context handle(s)"));
    }
    msg
}
