//! The transport engine boundary.
//!
//! A transport engine is a native, poll-driven communication library. It never blocks: every operation is submitted
//! with a completion callback and advanced by calls to [`TransportEngine::progress`]. This module defines the narrow
//! set of operations the rest of the crate relies on; everything behind it (capability negotiation, wire protocol,
//! tag matching, RDMA verbs) is the engine's business.
//!
//! # Callback rules
//!
//! * A completion callback is invoked at most once. It may run synchronously from the submitting call (the fast path
//!   for small or ready transfers), or later from inside `progress()` or `close()`.
//! * An engine must not hold any internal borrow while it invokes a callback. Callbacks may call straight back into
//!   the engine, e.g. an accept callback querying [`TransportEngine::conn_info`].
//! * [`TransportEngine::cancel`] drops the callback without invoking it.

#[cfg(feature = "loopback")]
pub mod loopback;

use crate::buffer::BufferDesc;
use crate::config::ConfigMap;
use crate::error::{TransportError, UcpError};
use std::fmt::{Display, Formatter};
use std::os::fd::BorrowedFd;
use std::rc::Rc;

/// Identifies a submitted operation for cancellation.
pub type OpToken = u64;

/// A connection owned by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnHandle(pub u64);

/// An accept service owned by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerHandle(pub u64);

/// Completion of a send, receive or shutdown.
pub type Completion = Box<dyn FnOnce(Result<(), TransportError>)>;

/// Completion of a connection attempt.
pub type ConnectCompletion = Box<dyn FnOnce(Result<ConnHandle, TransportError>)>;

/// Invoked once per accepted connection.
pub type AcceptCallback = Rc<dyn Fn(ConnHandle)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Version { major, minor, patch }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// What the engine knows about a connection.
#[derive(Clone, Debug)]
pub struct ConnInfo {
    /// Unique and stable for the life of the connection.
    pub uid: u64,
    /// Whether device memory can be transferred without staging through host memory.
    pub device_memory: bool,
    /// Free-form, human readable details.
    pub description: String,
}

pub trait TransportEngine {
    fn version(&self) -> Version;

    /// The live configuration the engine runs with.
    fn config(&self) -> ConfigMap;

    /// The native worker handle, as an address.
    fn worker_handle(&self) -> usize;

    /// Advances all in-flight operations without blocking. Returns `true` if anything advanced.
    ///
    /// Errors are never reported here. They reach the operation they belong to through its callback.
    fn progress(&self) -> bool;

    /// A descriptor that becomes readable when the engine has work for `progress()`. `None` means the engine can only
    /// be polled.
    fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    /// Re-arms the readiness descriptor before the caller goes to sleep on it.
    ///
    /// Returns `false` if work is already pending, in which case the caller must call `progress()` again instead of
    /// waiting.
    fn arm(&self) -> bool {
        true
    }

    /// Starts an accept service on `port`, or on an unused port if `None`. Fails with [`UcpError::Bind`].
    fn create_listener(&self, port: Option<u16>, on_accept: AcceptCallback) -> Result<ListenerHandle, UcpError>;

    /// The port a live accept service listens on.
    fn listener_port(&self, listener: ListenerHandle) -> Option<u16>;

    /// Stops an accept service and drops its callback. Idempotent.
    fn destroy_listener(&self, listener: ListenerHandle);

    fn connect(&self, address: &str, port: u16, on_complete: ConnectCompletion) -> OpToken;

    /// Sends the bytes described by `buffer` to the peer of `conn`.
    ///
    /// # Safety
    /// `buffer` must stay valid and unmodified until `on_complete` runs or the returned token is cancelled.
    unsafe fn send(&self, conn: ConnHandle, buffer: BufferDesc, on_complete: Completion) -> OpToken;

    /// Receives bytes from the peer of `conn` into `buffer`.
    ///
    /// # Safety
    /// `buffer` must be writable, and stay valid and otherwise untouched, until `on_complete` runs or the returned
    /// token is cancelled.
    unsafe fn recv(&self, conn: ConnHandle, buffer: BufferDesc, on_complete: Completion) -> OpToken;

    /// Tells the peer of `conn` that the connection is ending. Does not close `conn`.
    fn shutdown(&self, conn: ConnHandle, on_complete: Completion) -> OpToken;

    /// Detaches an operation: its buffer is no longer touched and its callback is dropped without being invoked.
    /// Unknown or finished tokens are ignored.
    fn cancel(&self, op: OpToken);

    /// Closes `conn` without notifying the peer. Operations still outstanding on it complete with an error before this
    /// returns.
    fn close(&self, conn: ConnHandle);

    fn conn_info(&self, conn: ConnHandle) -> Option<ConnInfo>;

    /// Releases every resource. Idempotent. Must not be called while operations are pending.
    fn destroy(&self);
}

/// Creates transport engines and answers questions that must not require one.
pub trait EngineFactory {
    /// The engine version. Does not create an engine.
    fn version(&self) -> Version;

    /// The configuration an engine created right now with no explicit options would use.
    fn default_config(&self) -> ConfigMap;

    /// Creates an engine with the given explicit options. Fails with [`UcpError::Config`] on bad options.
    fn create(&self, options: &ConfigMap) -> Result<Box<dyn TransportEngine>, UcpError>;
}

#[cfg(test)]
mod test {
    use super::Version;

    #[test]
    fn versions_order_and_display() {
        let v = Version::new(1, 7, 0);
        assert_eq!(v.to_string(), "1.7.0");
        assert!(v < Version::new(1, 10, 0));
    }
}
