//! Keeps in-flight operations advancing.
//!
//! The transport engine only moves forward when somebody calls its `progress()` routine. The [`ProgressDriver`]
//! decides who does that:
//!
//! - **Manual**: nobody. The caller interleaves [`ApplicationContext::progress`](crate::ApplicationContext::progress)
//!   with its own work.
//! - **Polling**: a local task calls `progress()` and yields, once per scheduler iteration.
//! - **Notification**: a local task sleeps on the engine's readiness descriptor and calls `progress()` whenever it
//!   fires. It is also woken right after every submission, so completions that happen before the descriptor next
//!   signals are not missed.
//!
//! Background tasks are spawned with [`tokio::task::spawn_local`], so contexts using them must be created inside a
//! [`tokio::task::LocalSet`]. Creating one elsewhere is a configuration error. The tasks hold only a weak reference to
//! their context and never keep it alive. Besides the engine, they run the context's listener handlers.

use crate::config::ProgressMode;
use crate::context::ContextInner;
use crate::engine::TransportEngine;
use crate::error::UcpError;
use log::*;
use std::cell::RefCell;
use std::future::{poll_fn, Future};
use std::os::fd::OwnedFd;
use std::panic::AssertUnwindSafe;
use std::rc::{Rc, Weak};
use std::task::Poll;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub(crate) struct ProgressDriver {
    mode: ProgressMode,
    wakeup: Rc<Notify>,
    task: RefCell<Option<JoinHandle<()>>>,
}

impl ProgressDriver {
    /// Resolves `requested` against what `engine` supports. Nothing runs until [`engage`](Self::engage).
    pub fn new(requested: ProgressMode, engine: &dyn TransportEngine) -> Result<Self, UcpError> {
        let has_fd = engine.readiness_fd().is_some();
        let mode = match requested {
            ProgressMode::Auto if has_fd => ProgressMode::Notification,
            ProgressMode::Auto => ProgressMode::Polling,
            ProgressMode::Notification if !has_fd => {
                return Err(UcpError::config("Notification progress requires an engine with a readiness descriptor"))
            }
            mode => mode,
        };
        Ok(Self { mode, wakeup: Rc::new(Notify::new()), task: RefCell::new(None) })
    }

    pub fn mode(&self) -> ProgressMode {
        self.mode
    }

    pub fn is_engaged(&self) -> bool {
        self.task.borrow().is_some()
    }

    /// Starts the background progress task, if the mode has one.
    pub fn engage(&self, ctx: Weak<ContextInner>, engine: &dyn TransportEngine) -> Result<(), UcpError> {
        let task = match self.mode {
            ProgressMode::Manual | ProgressMode::Auto => return Ok(()),
            ProgressMode::Polling => {
                require_runtime()?;
                spawn_on_local_set(poll_loop(ctx))?
            }
            ProgressMode::Notification => {
                require_runtime()?;
                let fd = engine
                    .readiness_fd()
                    .ok_or_else(|| UcpError::config("The engine no longer exposes a readiness descriptor"))?
                    .try_clone_to_owned()?;
                // SAFETY: `fd` is an owned duplicate, open until the `AsyncFd` holding it is dropped.
                let fd = unsafe { AsyncFd::register_with_interest(fd, Interest::READABLE) }
                    .map_err(std::io::Error::from)?;
                spawn_on_local_set(notification_loop(ctx, fd, Rc::clone(&self.wakeup)))?
            }
        };
        debug!("Progress driver engaged in {} mode", self.mode);
        *self.task.borrow_mut() = Some(task);
        Ok(())
    }

    /// Signals that an operation was just submitted.
    pub fn wake(&self) {
        if self.mode == ProgressMode::Notification {
            self.wakeup.notify_one();
        }
    }

    /// Stops the background task. Idempotent.
    pub fn disengage(&self) {
        if let Some(task) = self.task.borrow_mut().take() {
            task.abort();
            debug!("Progress driver disengaged");
        }
    }
}

fn require_runtime() -> Result<(), UcpError> {
    tokio::runtime::Handle::try_current()
        .map(|_| ())
        .map_err(|e| UcpError::config(format!("Automatic progress needs a running tokio LocalSet. {e}")))
}

/// Spawns `task` on the current `LocalSet`.
///
/// tokio only reports a missing `LocalSet` by panicking inside `spawn_local`, so that panic is caught here and turned
/// into an error. The runtime's panic hook still prints its message.
fn spawn_on_local_set<F>(task: F) -> Result<JoinHandle<()>, UcpError>
where
    F: Future<Output = ()> + 'static,
{
    std::panic::catch_unwind(AssertUnwindSafe(move || tokio::task::spawn_local(task))).map_err(|_| {
        UcpError::config("Automatic progress needs a running tokio LocalSet. Use manual progress outside of one.")
    })
}

/// Runs the ready listener handlers of `ctx` on behalf of the current task. `false` once the context is gone.
async fn run_handlers(ctx: &Weak<ContextInner>) -> bool {
    poll_fn(|cx| {
        Poll::Ready(match ctx.upgrade() {
            Some(inner) => {
                inner.poll_handlers(cx);
                true
            }
            None => false,
        })
    })
    .await
}

/// Completes once a listener handler finishes, or the context is gone.
async fn handler_finished(ctx: &Weak<ContextInner>) {
    poll_fn(|cx| match ctx.upgrade() {
        Some(inner) if !inner.poll_handlers(cx) => Poll::Pending,
        _ => Poll::Ready(()),
    })
    .await
}

async fn poll_loop(ctx: Weak<ContextInner>) {
    loop {
        match ctx.upgrade() {
            Some(inner) => {
                inner.engine().progress();
            }
            None => break,
        }
        if !run_handlers(&ctx).await {
            break;
        }
        tokio::task::yield_now().await;
    }
    trace!("Polling progress task finished");
}

async fn notification_loop(ctx: Weak<ContextInner>, fd: AsyncFd<OwnedFd>, wakeup: Rc<Notify>) {
    loop {
        let armed = match ctx.upgrade() {
            Some(inner) => {
                let engine = inner.engine();
                while engine.progress() {}
                engine.arm()
            }
            None => break,
        };
        if !run_handlers(&ctx).await {
            break;
        }
        if !armed {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            ready = fd.readable() => match ready {
                Ok(mut guard) => guard.clear_ready(),
                Err(err) => {
                    error!("Readiness descriptor failed, falling back to polling. {err}");
                    poll_loop(ctx).await;
                    return;
                }
            },
            _ = wakeup.notified() => {}
            _ = handler_finished(&ctx) => {}
        }
    }
    trace!("Notification progress task finished");
}
