//! The process-wide wrapper.
//!
//! Most programs want one context and no plumbing. These functions manage a global [`ApplicationContext`] for the
//! current thread (contexts are single-threaded, so "global" means per scheduler thread):
//!
//! * It is created on first use by [`get_or_create`] (and every function that needs one) with default options, or
//!   explicitly with [`init`].
//! * It is destroyed only by [`reset`], never implicitly.
//! * If [`reset`] fails because endpoints or listeners are still alive, the old context is remembered. Until those are
//!   released, [`init`], [`get_or_create`] and [`reset`] keep failing with [`UcpError::ResourceLeak`], so a new engine
//!   never coexists with the old one.
//!
//! Code that wants more control can skip this module and pass an [`ApplicationContext`] around instead.

use crate::config::{filter_env_overrides, process_env_keys, ConfigMap, ProgressMode};
use crate::context::{leak_report, ApplicationContext, ContextInner};
use crate::endpoint::Endpoint;
use crate::engine::{EngineFactory, Version};
use crate::error::UcpError;
use crate::listener::Listener;
use log::*;
use std::cell::RefCell;
use std::future::Future;
use std::rc::{Rc, Weak};

struct GlobalState {
    ctx: Option<ApplicationContext>,
    torn_down: Option<Weak<ContextInner>>,
    factory: Option<Rc<dyn EngineFactory>>,
    mode: ProgressMode,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self { ctx: None, torn_down: None, factory: default_factory(), mode: ProgressMode::Auto }
    }
}

#[cfg(feature = "loopback")]
fn default_factory() -> Option<Rc<dyn EngineFactory>> {
    Some(Rc::new(crate::engine::loopback::LoopbackFactory))
}

#[cfg(not(feature = "loopback"))]
fn default_factory() -> Option<Rc<dyn EngineFactory>> {
    None
}

thread_local! {
    static GLOBAL: RefCell<GlobalState> = RefCell::new(GlobalState::default());
}

fn current() -> Option<ApplicationContext> {
    GLOBAL.with_borrow(|g| g.ctx.clone())
}

fn factory() -> Result<Rc<dyn EngineFactory>, UcpError> {
    GLOBAL
        .with_borrow(|g| g.factory.clone())
        .ok_or_else(|| UcpError::config("No transport engine is available. Call set_engine_factory() first."))
}

/// Fails if a context torn down by an earlier, failed [`reset`] is still alive.
fn check_torn_down() -> Result<(), UcpError> {
    let zombie = GLOBAL.with_borrow(|g| g.torn_down.as_ref().map(Weak::upgrade));
    match zombie {
        None => Ok(()),
        Some(None) => {
            debug!("The previously reset context has been released");
            GLOBAL.with_borrow_mut(|g| g.torn_down = None);
            Ok(())
        }
        Some(Some(inner)) => Err(UcpError::ResourceLeak(leak_report(&inner))),
    }
}

fn create(options: &ConfigMap) -> Result<ApplicationContext, UcpError> {
    let factory = factory()?;
    let mode = GLOBAL.with_borrow(|g| g.mode);
    let ctx = ApplicationContext::from_factory(factory.as_ref(), options, mode)?;
    GLOBAL.with_borrow_mut(|g| g.ctx = Some(ctx.clone()));
    Ok(ctx)
}

/// The engine version. Never creates a context.
pub fn get_version() -> Result<Version, UcpError> {
    Ok(factory()?.version())
}

/// Creates the global context with explicit options.
///
/// With `env_takes_precedence`, every option that is also set as an environment variable is dropped first, so the
/// environment wins. Fails with [`UcpError::AlreadyInitialized`] if a context exists; call [`reset`] first.
pub fn init(options: ConfigMap, env_takes_precedence: bool) -> Result<(), UcpError> {
    if current().is_some() {
        return Err(UcpError::AlreadyInitialized);
    }
    check_torn_down()?;
    let mut options = options;
    if env_takes_precedence {
        filter_env_overrides(&mut options, process_env_keys());
    }
    create(&options)?;
    Ok(())
}

/// The global context, created with default options if there is none yet.
///
/// Engines may bind hardware resources that do not survive a `fork()`, so call this after forking.
pub fn get_or_create() -> Result<ApplicationContext, UcpError> {
    if let Some(ctx) = current() {
        return Ok(ctx);
    }
    check_torn_down()?;
    create(&ConfigMap::new())
}

/// Whether a global context exists right now.
pub fn is_initialized() -> bool {
    current().is_some()
}

/// See [`ApplicationContext::create_listener`].
pub fn create_listener<F, Fut>(handler: F, port: Option<u16>) -> Result<Listener, UcpError>
where
    F: Fn(Endpoint) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    get_or_create()?.create_listener(handler, port)
}

/// See [`ApplicationContext::create_endpoint`].
pub async fn create_endpoint(address: &str, port: u16) -> Result<Endpoint, UcpError> {
    let ctx = get_or_create()?;
    ctx.create_endpoint(address, port).await
}

/// See [`ApplicationContext::progress`].
pub fn progress() -> Result<bool, UcpError> {
    Ok(get_or_create()?.progress())
}

pub fn get_worker_handle() -> Result<usize, UcpError> {
    Ok(get_or_create()?.worker_handle())
}

/// The effective configuration of the global context, or the defaults if there is none. Never creates a context.
pub fn get_config() -> Result<ConfigMap, UcpError> {
    match current() {
        Some(ctx) => Ok(ctx.config()),
        None => Ok(factory()?.default_config()),
    }
}

/// Destroys the global context.
///
/// Fails with [`UcpError::ResourceLeak`], naming every endpoint and listener still alive, if anything references the
/// context. The context is then destroyed as soon as the last of them is released, and this keeps failing until that
/// has happened. Resetting when there is no context is a no-op.
pub fn reset() -> Result<(), UcpError> {
    let ctx = GLOBAL.with_borrow_mut(|g| g.ctx.take());
    let Some(ctx) = ctx else {
        return check_torn_down();
    };
    let weak = ctx.downgrade();
    match ctx.teardown() {
        Ok(()) => {
            info!("Transport reset");
            Ok(())
        }
        Err(err) => {
            GLOBAL.with_borrow_mut(|g| g.torn_down = Some(weak));
            Err(err)
        }
    }
}

/// Replaces the engine factory used for new global contexts. Fails with [`UcpError::AlreadyInitialized`] while a
/// context exists.
pub fn set_engine_factory(factory: Rc<dyn EngineFactory>) -> Result<(), UcpError> {
    GLOBAL.with_borrow_mut(|g| {
        if g.ctx.is_some() {
            return Err(UcpError::AlreadyInitialized);
        }
        g.factory = Some(factory);
        Ok(())
    })
}

/// Sets how new global contexts are progressed. Fails with [`UcpError::AlreadyInitialized`] while a context exists.
pub fn set_progress_mode(mode: ProgressMode) -> Result<(), UcpError> {
    GLOBAL.with_borrow_mut(|g| {
        if g.ctx.is_some() {
            return Err(UcpError::AlreadyInitialized);
        }
        g.mode = mode;
        Ok(())
    })
}
