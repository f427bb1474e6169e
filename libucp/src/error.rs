use thiserror::Error;

/// A failure reported by the transport engine for an in-flight operation.
///
/// When `connection_lost` is set the engine considers the connection dead. The owning
/// [`Endpoint`](crate::Endpoint) remembers the error and fails every later operation with it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    message: String,
    connection_lost: bool,
}

impl TransportError {
    pub fn new(msg: impl Into<String>) -> Self {
        TransportError { message: msg.into(), connection_lost: false }
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        TransportError { message: msg.into(), connection_lost: true }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_connection_lost(&self) -> bool {
        self.connection_lost
    }
}

#[derive(Debug, Error)]
pub enum UcpError {
    #[error("Invalid transport configuration. {0}")]
    Config(String),
    #[error("The transport is already initialized. Call reset() and then init() to re-initialize it with new options.")]
    AlreadyInitialized,
    #[error("Could not start listening. {0}")]
    Bind(String),
    #[error("Could not connect to {address}:{port}. {reason}")]
    Connection { address: String, port: u16, reason: String },
    #[error("Invalid argument. {0}")]
    InvalidArgument(String),
    #[error("Transport operation failed. {0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    ResourceLeak(String),
    #[error("The listener is closed and no longer listening.")]
    NotListening,
    #[error("The endpoint is closed.")]
    EndpointClosed,
    #[error("I/O error. {0}")]
    Io(#[from] std::io::Error),
}

impl UcpError {
    pub fn config(msg: impl Into<String>) -> Self {
        UcpError::Config(msg.into())
    }

    pub fn bind(msg: impl Into<String>) -> Self {
        UcpError::Bind(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        UcpError::InvalidArgument(msg.into())
    }

    /// The transport error behind this failure, if the engine reported one.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            UcpError::Transport(err) => Some(err),
            _ => None,
        }
    }
}
