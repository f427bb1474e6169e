//! Bridges engine completion callbacks to awaitable futures.
//!
//! Every submission registers a continuation (the sending half of a oneshot channel) in a [`PendingOps`] table under a
//! fresh [`OpId`]. The callback handed to the engine carries only that id and a weak reference to the table. When the
//! engine completes the operation, the callback removes the entry and resolves the continuation, so each operation is
//! completed exactly once.
//!
//! The awaiting side is a [`PendingOp`]. Dropping it before completion (e.g. on a timeout) removes the entry and
//! cancels the engine operation. A completion arriving after that finds no entry and is ignored.
//!
//! Some results own engine resources (an established connection). A table built with
//! [`PendingOps::with_orphan_handler`] hands every successful result nobody will ever receive to its handler, whether
//! the awaiting side was gone when the completion arrived or dropped the future after it arrived.

use crate::engine::{OpToken, TransportEngine};
use crate::error::TransportError;
use futures::channel::oneshot;
use log::*;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

pub(crate) type OpId = u64;

type Continuation<T> = oneshot::Sender<Result<T, TransportError>>;
type OrphanHandler<T> = Box<dyn Fn(T)>;

struct PendingEntry<T> {
    sender: Continuation<T>,
    token: Option<OpToken>,
}

/// Continuations of in-flight operations, keyed by [`OpId`].
pub(crate) struct PendingOps<T> {
    next_id: Cell<OpId>,
    pending: RefCell<HashMap<OpId, PendingEntry<T>>>,
    on_orphan: Option<OrphanHandler<T>>,
}

impl<T> Default for PendingOps<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingOps<T> {
    pub fn new() -> Self {
        Self { next_id: Cell::new(1), pending: RefCell::new(HashMap::new()), on_orphan: None }
    }

    /// A table that passes successful results nobody receives to `on_orphan`.
    pub fn with_orphan_handler(on_orphan: impl Fn(T) + 'static) -> Self {
        Self { on_orphan: Some(Box::new(on_orphan)), ..Self::new() }
    }

    /// Registers a new continuation and returns its id together with the receiving half.
    pub fn register(&self) -> (OpId, oneshot::Receiver<Result<T, TransportError>>) {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let (sender, receiver) = oneshot::channel();
        self.pending.borrow_mut().insert(id, PendingEntry { sender, token: None });
        (id, receiver)
    }

    /// Records the engine token for `id`. A no-op if the operation already completed during submission.
    pub fn set_token(&self, id: OpId, token: OpToken) {
        if let Some(entry) = self.pending.borrow_mut().get_mut(&id) {
            entry.token = Some(token);
        }
    }

    /// Resolves the continuation for `id`. Returns `true` if the result was delivered to a waiting future.
    ///
    /// A result nobody receives, because the operation was detached or the awaiting side is gone, goes to the orphan
    /// handler.
    pub fn complete(&self, id: OpId, result: Result<T, TransportError>) -> bool {
        let entry = self.pending.borrow_mut().remove(&id);
        let undelivered = match entry {
            Some(entry) => match entry.sender.send(result) {
                Ok(()) => {
                    trace!("Operation {id} completed");
                    return true;
                }
                Err(result) => {
                    warn!("Operation {id} completed but nobody is waiting for it any more");
                    result
                }
            },
            None => {
                trace!("Late completion for detached operation {id}");
                result
            }
        };
        if let Ok(value) = undelivered {
            self.orphaned(value);
        }
        false
    }

    fn orphaned(&self, value: T) {
        if let Some(on_orphan) = &self.on_orphan {
            on_orphan(value);
        }
    }

    /// Removes the continuation for `id`. Returns the engine token if the operation was still pending.
    pub fn detach(&self, id: OpId) -> Option<OpToken> {
        self.pending.borrow_mut().remove(&id).and_then(|entry| entry.token)
    }

    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }
}

impl<T: 'static> PendingOps<T> {
    /// The callback to hand to the engine for operation `id`. Holds only a weak reference to the table.
    pub fn callback(self: &Rc<Self>, id: OpId) -> Box<dyn FnOnce(Result<T, TransportError>)> {
        let ops = Rc::downgrade(self);
        Box::new(move |result| match ops.upgrade() {
            Some(ops) => {
                ops.complete(id, result);
            }
            None => warn!("Operation {id} completed after its context was torn down"),
        })
    }
}

/// A suspended operation. Resolves once the engine reports completion.
pub(crate) struct PendingOp<T> {
    id: OpId,
    receiver: oneshot::Receiver<Result<T, TransportError>>,
    ops: Rc<PendingOps<T>>,
    engine: Rc<dyn TransportEngine>,
    finished: bool,
}

impl<T> PendingOp<T> {
    pub fn new(
        id: OpId,
        receiver: oneshot::Receiver<Result<T, TransportError>>,
        ops: Rc<PendingOps<T>>,
        engine: Rc<dyn TransportEngine>,
    ) -> Self {
        Self { id, receiver, ops, engine, finished: false }
    }
}

impl<T> Future for PendingOp<T> {
    type Output = Result<T, TransportError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(result) => {
                this.finished = true;
                Poll::Ready(result.unwrap_or_else(|_| Err(TransportError::new("Operation was dropped before completion"))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for PendingOp<T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(token) = self.ops.detach(self.id) {
            trace!("Operation {} abandoned before completion. Cancelling engine operation {token}", self.id);
            self.engine.cancel(token);
        }
        // Completed, but the result was never polled out.
        if let Ok(Some(Ok(value))) = self.receiver.try_recv() {
            debug!("Operation {} abandoned after it completed", self.id);
            self.ops.orphaned(value);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn completion_is_delivered_once() {
        let ops = Rc::new(PendingOps::<u32>::new());
        let (id, mut receiver) = ops.register();
        assert_eq!(ops.len(), 1);
        assert!(ops.complete(id, Ok(7)));
        assert!(ops.is_empty());
        assert_eq!(receiver.try_recv().unwrap(), Some(Ok(7)));
        // A second completion for the same id finds nothing.
        assert!(!ops.complete(id, Ok(8)));
    }

    #[test]
    fn callback_resolves_continuation() {
        let ops = Rc::new(PendingOps::<()>::new());
        let (id, receiver) = ops.register();
        let callback = ops.callback(id);
        callback(Err(TransportError::new("boom")));
        let result = receiver.now_or_never().expect("resolved").expect("not cancelled");
        assert_eq!(result.unwrap_err().message(), "boom");
    }

    #[test]
    fn detached_operation_ignores_late_completion() {
        let ops = Rc::new(PendingOps::<()>::new());
        let (id, _receiver) = ops.register();
        ops.set_token(id, 42);
        assert_eq!(ops.detach(id), Some(42));
        let callback = ops.callback(id);
        callback(Ok(()));
        assert!(ops.is_empty());
    }

    #[test]
    fn undelivered_results_go_to_the_orphan_handler() {
        let orphans = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&orphans);
        let ops = Rc::new(PendingOps::with_orphan_handler(move |v: u32| seen.borrow_mut().push(v)));
        let (id, receiver) = ops.register();
        drop(receiver);
        assert!(!ops.complete(id, Ok(1)));

        let (id, _receiver) = ops.register();
        ops.detach(id);
        assert!(!ops.complete(id, Err(TransportError::new("refused"))));
        assert!(!ops.complete(id, Ok(2)));
        assert_eq!(*orphans.borrow(), vec![1, 2]);
    }

    #[test]
    fn callback_outliving_table_is_harmless() {
        let ops = Rc::new(PendingOps::<()>::new());
        let (id, _receiver) = ops.register();
        let callback = ops.callback(id);
        drop(ops);
        callback(Ok(()));
    }

    #[test]
    fn token_is_not_recorded_after_fast_completion() {
        let ops = Rc::new(PendingOps::<()>::new());
        let (id, _receiver) = ops.register();
        ops.complete(id, Ok(()));
        ops.set_token(id, 3);
        assert_eq!(ops.detach(id), None);
    }
}
