use crate::context::{ApplicationContext, ReferentKind};
use crate::engine::ListenerHandle;
use crate::error::UcpError;
use log::*;
use std::cell::RefCell;
use std::fmt::{Debug, Formatter};

struct Bound {
    ctx: ApplicationContext,
    handle: ListenerHandle,
    port: u16,
    referent: u64,
}

/// A handle to the accept service started by [`ApplicationContext::create_listener`].
///
/// The service keeps accepting until [`close`](Self::close) is called or the listener is dropped, so keep it alive for
/// as long as connections should be accepted.
pub struct Listener {
    bound: RefCell<Option<Bound>>,
}

impl Listener {
    pub(crate) fn new(ctx: ApplicationContext, handle: ListenerHandle) -> Self {
        let port = ctx.engine().listener_port(handle).unwrap_or_default();
        let referent = ctx.register_referent(ReferentKind::Listener, format!("listening on port {port}"));
        info!("Listening for connections on port {port}");
        Self { bound: RefCell::new(Some(Bound { ctx, handle, port, referent })) }
    }

    pub fn closed(&self) -> bool {
        self.bound.borrow().is_none()
    }

    /// The port this listener accepts connections on.
    pub fn port(&self) -> Result<u16, UcpError> {
        self.bound.borrow().as_ref().map(|b| b.port).ok_or(UcpError::NotListening)
    }

    /// Stops accepting connections. Idempotent. Handlers already running are not affected.
    pub fn close(&self) {
        let bound = self.bound.borrow_mut().take();
        if let Some(Bound { ctx, handle, port, referent }) = bound {
            ctx.engine().destroy_listener(handle);
            ctx.unregister_referent(referent);
            debug!("Listener on port {port} closed");
        }
    }
}

impl Debug for Listener {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("port", &self.port().ok()).field("closed", &self.closed()).finish()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}
