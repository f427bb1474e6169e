//! Context, endpoint and listener lifecycle over a poll-driven transport engine.
//!
//! A native transport engine never blocks: operations are submitted with a completion callback and advance only when
//! its `progress()` routine is called. This crate bridges that model into tokio's single-threaded cooperative
//! scheduler. Sends, receives and connection attempts become futures, a progress driver keeps the engine
//! moving, and teardown refuses to destroy an engine that endpoints or listeners still use.
//!
//! Everything here is `!Send` and must run inside a [`tokio::task::LocalSet`].

pub mod api;
pub mod buffer;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod listener;
mod pending;
mod progress;

pub use api::{
    create_endpoint, create_listener, get_config, get_or_create, get_version, get_worker_handle, init, is_initialized,
    progress, reset, set_engine_factory, set_progress_mode,
};
pub use buffer::Buffer;
pub use config::{ConfigMap, ProgressMode};
pub use context::{ApplicationContext, Referent, ReferentKind};
pub use endpoint::Endpoint;
pub use error::{TransportError, UcpError};
pub use listener::Listener;
