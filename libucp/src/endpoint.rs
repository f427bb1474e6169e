use crate::buffer::Buffer;
use crate::context::{ApplicationContext, ReferentKind};
use crate::engine::ConnHandle;
use crate::error::{TransportError, UcpError};
use crate::pending::PendingOp;
use log::*;
use std::cell::RefCell;
use std::fmt::{Debug, Formatter};

struct Connection {
    ctx: ApplicationContext,
    conn: ConnHandle,
    referent: u64,
}

/// One connection to a peer.
///
/// Created by [`ApplicationContext::create_endpoint`] or handed to a listener's handler. All operations take `&self`,
/// so an endpoint shared through an `Rc` can have sends and receives in flight at the same time. Their completions
/// are independent, but no ordering between concurrently issued operations is guaranteed: sequence the awaits if order
/// matters.
///
/// Dropping an open endpoint closes it. Forgetting to close an endpoint that is kept alive makes
/// [`reset`](crate::reset) fail with [`UcpError::ResourceLeak`].
pub struct Endpoint {
    uid: u64,
    device_memory: bool,
    connection: RefCell<Option<Connection>>,
    failure: RefCell<Option<TransportError>>,
}

impl Endpoint {
    pub(crate) fn new(ctx: ApplicationContext, conn: ConnHandle) -> Self {
        let info = ctx.engine().conn_info(conn);
        let (uid, device_memory, description) = match info {
            Some(info) => (info.uid, info.device_memory, info.description),
            None => (conn.0, false, format!("connection {}", conn.0)),
        };
        let referent = ctx.register_referent(ReferentKind::Endpoint, description);
        Self {
            uid,
            device_memory,
            connection: RefCell::new(Some(Connection { ctx, conn, referent })),
            failure: RefCell::new(None),
        }
    }

    /// Unique identifier of the underlying connection, stable for its whole life.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn closed(&self) -> bool {
        self.connection.borrow().is_none()
    }

    /// Whether the transport can move device memory on this connection without staging through host memory.
    pub fn device_memory_support(&self) -> bool {
        self.device_memory
    }

    /// Human readable details about the underlying connection.
    pub fn info(&self) -> Result<String, UcpError> {
        let (ctx, conn) = self.live()?;
        let info = ctx.engine().conn_info(conn).ok_or(UcpError::EndpointClosed)?;
        Ok(info.description)
    }

    /// The native worker handle of the owning context.
    pub fn worker_handle(&self) -> Result<usize, UcpError> {
        let (ctx, _) = self.live()?;
        Ok(ctx.worker_handle())
    }

    /// The native connection handle.
    pub fn raw_handle(&self) -> Result<u64, UcpError> {
        let (_, conn) = self.live()?;
        Ok(conn.0)
    }

    /// Sends the first `nbytes` bytes of `buffer` (all of it if `None`) to the peer.
    pub async fn send<'b>(&self, buffer: impl Into<Buffer<'b>>, nbytes: Option<usize>) -> Result<(), UcpError> {
        let buffer = buffer.into();
        let desc = buffer.send_desc(nbytes)?;
        let pending = {
            let (ctx, conn) = self.live()?;
            trace!("Endpoint {}: sending {} bytes", self.uid, desc.len());
            // SAFETY: `buffer` borrows the memory for as long as this future lives. If the future is dropped first,
            // `PendingOp` cancels the engine operation before the borrow ends.
            ctx.submit(|engine, on_complete| unsafe { engine.send(conn, desc, on_complete) })
        };
        self.finish(pending).await
    }

    /// Receives `nbytes` bytes (the whole buffer if `None`) from the peer into `buffer`.
    pub async fn recv<'b>(&self, buffer: impl Into<Buffer<'b>>, nbytes: Option<usize>) -> Result<(), UcpError> {
        let mut buffer = buffer.into();
        let desc = buffer.recv_desc(nbytes)?;
        let pending = {
            let (ctx, conn) = self.live()?;
            trace!("Endpoint {}: receiving {} bytes", self.uid, desc.len());
            // SAFETY: as in `send`. The exclusive borrow held by `buffer` keeps every other view of the memory out.
            ctx.submit(|engine, on_complete| unsafe { engine.recv(conn, desc, on_complete) })
        };
        self.finish(pending).await
    }

    /// Tells the peer that this connection is ending. The endpoint stays open; use [`close`](Self::close) for that.
    pub async fn signal_shutdown(&self) -> Result<(), UcpError> {
        let pending = {
            let (ctx, conn) = self.live()?;
            debug!("Endpoint {}: signalling shutdown to peer", self.uid);
            ctx.submit(|engine, on_complete| engine.shutdown(conn, on_complete))
        };
        self.finish(pending).await
    }

    /// Closes the connection immediately, without notifying the peer. Idempotent.
    ///
    /// Operations still in flight on this endpoint fail.
    pub fn close(&self) {
        let connection = self.connection.borrow_mut().take();
        if let Some(Connection { ctx, conn, referent }) = connection {
            ctx.engine().close(conn);
            ctx.unregister_referent(referent);
            debug!("Endpoint {} closed", self.uid);
        }
    }

    fn live(&self) -> Result<(ApplicationContext, ConnHandle), UcpError> {
        if let Some(err) = self.failure.borrow().as_ref() {
            return Err(UcpError::Transport(err.clone()));
        }
        match self.connection.borrow().as_ref() {
            Some(c) => Ok((c.ctx.clone(), c.conn)),
            None => Err(UcpError::EndpointClosed),
        }
    }

    async fn finish(&self, pending: PendingOp<()>) -> Result<(), UcpError> {
        match pending.await {
            Ok(()) => Ok(()),
            Err(err) => {
                if err.is_connection_lost() {
                    warn!("Endpoint {}: connection lost. {err}", self.uid);
                    self.failure.borrow_mut().get_or_insert_with(|| err.clone());
                } else {
                    debug!("Endpoint {}: operation failed. {err}", self.uid);
                }
                Err(UcpError::Transport(err))
            }
        }
    }
}

impl Debug for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").field("uid", &self.uid).field("closed", &self.closed()).finish()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}
