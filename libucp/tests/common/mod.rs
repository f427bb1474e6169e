#![allow(dead_code)]

use libucp::buffer::BufferDesc;
use libucp::config::ConfigMap;
use libucp::engine::loopback::{LoopbackFactory, LOOPBACK_VERSION};
use libucp::engine::{
    AcceptCallback, Completion, ConnHandle, ConnInfo, ConnectCompletion, EngineFactory, ListenerHandle, OpToken,
    TransportEngine, Version,
};
use libucp::{ApplicationContext, Endpoint, Listener, UcpError};
use std::cell::Cell;
use std::future::Future;
use std::os::fd::BorrowedFd;
use std::rc::Rc;
use tokio::sync::mpsc;
use tokio::task::LocalSet;

pub fn init_logging() {
    env_logger::try_init().ok();
}

/// Runs `fut` inside a fresh `LocalSet`.
pub async fn local<F: Future>(fut: F) -> F::Output {
    LocalSet::new().run_until(fut).await
}

/// Engine calls seen by a [`CountingEngine`].
#[derive(Default)]
pub struct Counters {
    pub sends: Cell<usize>,
    pub recvs: Cell<usize>,
    pub connects: Cell<usize>,
    pub cancels: Cell<usize>,
    pub closes: Cell<usize>,
    pub destroys: Cell<usize>,
}

impl Counters {
    pub fn submissions(&self) -> usize {
        self.sends.get() + self.recvs.get() + self.connects.get()
    }
}

fn bump(counter: &Cell<usize>) {
    counter.set(counter.get() + 1);
}

/// A loopback engine that counts calls and carries one extra option, so configuration layering can be observed.
pub struct CountingEngine {
    inner: Box<dyn TransportEngine>,
    extra: ConfigMap,
    counters: Rc<Counters>,
}

impl TransportEngine for CountingEngine {
    fn version(&self) -> Version {
        self.inner.version()
    }

    fn config(&self) -> ConfigMap {
        let mut config = self.inner.config();
        config.extend(self.extra.clone());
        config
    }

    fn worker_handle(&self) -> usize {
        self.inner.worker_handle()
    }

    fn progress(&self) -> bool {
        self.inner.progress()
    }

    fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        self.inner.readiness_fd()
    }

    fn arm(&self) -> bool {
        self.inner.arm()
    }

    fn create_listener(&self, port: Option<u16>, on_accept: AcceptCallback) -> Result<ListenerHandle, UcpError> {
        self.inner.create_listener(port, on_accept)
    }

    fn listener_port(&self, listener: ListenerHandle) -> Option<u16> {
        self.inner.listener_port(listener)
    }

    fn destroy_listener(&self, listener: ListenerHandle) {
        self.inner.destroy_listener(listener)
    }

    fn connect(&self, address: &str, port: u16, on_complete: ConnectCompletion) -> OpToken {
        bump(&self.counters.connects);
        self.inner.connect(address, port, on_complete)
    }

    unsafe fn send(&self, conn: ConnHandle, buffer: BufferDesc, on_complete: Completion) -> OpToken {
        bump(&self.counters.sends);
        self.inner.send(conn, buffer, on_complete)
    }

    unsafe fn recv(&self, conn: ConnHandle, buffer: BufferDesc, on_complete: Completion) -> OpToken {
        bump(&self.counters.recvs);
        self.inner.recv(conn, buffer, on_complete)
    }

    fn shutdown(&self, conn: ConnHandle, on_complete: Completion) -> OpToken {
        self.inner.shutdown(conn, on_complete)
    }

    fn cancel(&self, op: OpToken) {
        bump(&self.counters.cancels);
        self.inner.cancel(op)
    }

    fn close(&self, conn: ConnHandle) {
        bump(&self.counters.closes);
        self.inner.close(conn)
    }

    fn conn_info(&self, conn: ConnHandle) -> Option<ConnInfo> {
        self.inner.conn_info(conn)
    }

    fn destroy(&self) {
        bump(&self.counters.destroys);
        self.inner.destroy()
    }
}

/// Builds [`CountingEngine`]s that accept the extra option `key` (default value `"default"`).
pub struct TestFactory {
    pub key: &'static str,
    pub counters: Rc<Counters>,
}

impl TestFactory {
    pub fn new(key: &'static str) -> Self {
        Self { key, counters: Rc::new(Counters::default()) }
    }

    fn extra(&self, explicit: Option<&String>) -> ConfigMap {
        let value = explicit.cloned().or_else(|| std::env::var(self.key).ok()).unwrap_or_else(|| "default".into());
        [(self.key.to_string(), value)].into_iter().collect()
    }
}

impl EngineFactory for TestFactory {
    fn version(&self) -> Version {
        LOOPBACK_VERSION
    }

    fn default_config(&self) -> ConfigMap {
        let mut config = LoopbackFactory.default_config();
        config.extend(self.extra(None));
        config
    }

    fn create(&self, options: &ConfigMap) -> Result<Box<dyn TransportEngine>, UcpError> {
        let mut options = options.clone();
        let extra = self.extra(options.remove(self.key).as_ref());
        let inner = LoopbackFactory.create(&options)?;
        Ok(Box::new(CountingEngine { inner, extra, counters: Rc::clone(&self.counters) }))
    }
}

/// Starts a listener on an unused port and connects one endpoint to it. Returns (listener, client, server).
pub async fn connected_pair(ctx: &ApplicationContext) -> (Listener, Endpoint, Endpoint) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = ctx
        .create_listener(
            move |ep| {
                let tx = tx.clone();
                async move {
                    tx.send(ep).ok();
                }
            },
            None,
        )
        .expect("listener");
    let port = listener.port().expect("port");
    let client = ctx.create_endpoint("127.0.0.1", port).await.expect("connect");
    let server = rx.recv().await.expect("accepted endpoint");
    (listener, client, server)
}
