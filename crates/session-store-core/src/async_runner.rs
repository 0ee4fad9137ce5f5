//! Async action runner: side-effecting handlers off the serialized path.
//!
//! Async handlers never touch state directly. They receive a [`Dispatcher`]
//! to re-enter the store with follow-up actions and must hand back a
//! [`CancellationHandle`] so pending work can be aborted at session teardown.
//! Handles are kept in a shared registry so teardown cancels everything,
//! including pending debounce timers, in one pass.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde_json::Value;
use tokio::task::AbortHandle;

use crate::{
    action::Action,
    error::StoreError,
    reducer::AsyncApplyFn,
    store::Dispatcher,
};

/// Idempotent, zero-argument cancellation of pending async or timer work.
///
/// Safe to invoke from any thread, any number of times, including
/// concurrently with the work's own completion; anything after the first
/// effective call is a no-op.
#[derive(Clone)]
pub struct CancellationHandle {
    inner: Arc<Kind>,
}

enum Kind {
    Noop,
    Abort(AbortHandle),
    Once(Mutex<Option<Box<dyn FnOnce() + Send>>>),
}

impl CancellationHandle {
    /// A handle with nothing to cancel.
    #[must_use]
    pub fn noop() -> Self {
        Self { inner: Arc::new(Kind::Noop) }
    }

    /// Wrap a closure invoked at most once.
    #[must_use]
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Kind::Once(Mutex::new(Some(Box::new(cancel))))),
        }
    }

    /// Wrap a tokio task's abort handle. Aborting a finished task is
    /// already a no-op, which gives the idempotence contract for free.
    #[must_use]
    pub fn from_abort(handle: AbortHandle) -> Self {
        Self { inner: Arc::new(Kind::Abort(handle)) }
    }

    /// Cancel the pending work, if any remains.
    pub fn cancel(&self) {
        match &*self.inner {
            Kind::Noop => {}
            Kind::Abort(handle) => handle.abort(),
            Kind::Once(slot) => {
                let cancel = slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(cancel) = cancel {
                    cancel();
                }
            }
        }
    }

    /// Whether the handle has nothing left to cancel.
    #[must_use]
    pub fn is_spent(&self) -> bool {
        match &*self.inner {
            Kind::Noop => true,
            Kind::Abort(handle) => handle.is_finished(),
            Kind::Once(slot) => slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_none(),
        }
    }
}

impl std::fmt::Debug for CancellationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationHandle")
            .field("spent", &self.is_spent())
            .finish()
    }
}

/// Spawn a future and return a handle that aborts it.
pub fn spawn_cancellable<F>(future: F) -> CancellationHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    CancellationHandle::from_abort(tokio::spawn(future).abort_handle())
}

/// What an async handler hands back to the store.
///
/// The store only accepts [`AsyncReturn::Handle`]; handing back a plain
/// value is the async-handler contract violation and fails the dispatch.
pub enum AsyncReturn {
    /// Cancellation handle for the started work.
    Handle(CancellationHandle),
    /// A plain value, i.e. the handler did not start cancellable work.
    Value(Value),
}

impl From<CancellationHandle> for AsyncReturn {
    fn from(handle: CancellationHandle) -> Self {
        Self::Handle(handle)
    }
}

impl From<Value> for AsyncReturn {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Shared registry of outstanding cancellation handles.
///
/// Jointly owned: the store registers async and debounce handles as they are
/// created, and the external teardown path calls [`HandleRegistry::cancel_all`]
/// once at session end.
#[derive(Clone, Default)]
pub struct HandleRegistry {
    inner: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handles: HashMap<u64, CancellationHandle>,
}

impl HandleRegistry {
    /// Register a handle, pruning spent ones first.
    pub fn register(&self, handle: CancellationHandle) -> u64 {
        let mut registry = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        registry.handles.retain(|_, h| !h.is_spent());
        let id = registry.next_id;
        registry.next_id += 1;
        registry.handles.insert(id, handle);
        id
    }

    /// Drop a handle without cancelling it.
    pub fn remove(&self, id: u64) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handles
            .remove(&id);
    }

    /// Cancel every outstanding handle. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<CancellationHandle> = {
            let mut registry = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            registry.handles.drain().map(|(_, h)| h).collect()
        };
        let pending = handles.iter().filter(|h| !h.is_spent()).count();
        for handle in handles {
            handle.cancel();
        }
        pending
    }

    /// Number of tracked handles, spent or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handles
            .len()
    }

    /// Whether the registry tracks no handles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hands actions to async handlers and tracks their cancellation handles.
pub(crate) struct AsyncRunner {
    registry: HandleRegistry,
}

impl AsyncRunner {
    pub(crate) fn new() -> Self {
        Self {
            registry: HandleRegistry::default(),
        }
    }

    pub(crate) fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    /// Run one async leg. The handler starts its work and must return a
    /// cancellation handle; anything else is a contract violation.
    pub(crate) fn run(
        &self,
        reducer: &str,
        async_apply: Option<&AsyncApplyFn>,
        action: &Action,
        dispatcher: Dispatcher,
        slice: &Value,
    ) -> Result<(), StoreError> {
        let Some(async_apply) = async_apply else {
            tracing::warn!(
                reducer,
                action_type = %action.action_type,
                "async action routed to a reducer without an async handler, skipping"
            );
            return Ok(());
        };

        match async_apply(action, dispatcher, slice) {
            AsyncReturn::Handle(handle) => {
                self.registry.register(handle);
                Ok(())
            }
            AsyncReturn::Value(value) => {
                tracing::error!(
                    reducer,
                    action_type = %action.action_type,
                    %value,
                    "async handler returned a value instead of a cancellation handle"
                );
                Err(StoreError::AsyncHandlerContract {
                    reducer: reducer.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_cancel_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let handle = CancellationHandle::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!handle.is_spent());
        handle.cancel();
        handle.cancel();
        handle.clone().cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handle.is_spent());
    }

    #[test]
    fn test_noop_handle_is_spent() {
        let handle = CancellationHandle::noop();
        handle.cancel();
        assert!(handle.is_spent());
    }

    #[test]
    fn test_registry_cancel_all() {
        let registry = HandleRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counted = Arc::clone(&calls);
            registry.register(CancellationHandle::new(move || {
                counted.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.cancel_all(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
        // A second pass has nothing left to cancel.
        assert_eq!(registry.cancel_all(), 0);
    }

    #[test]
    fn test_register_prunes_spent_handles() {
        let registry = HandleRegistry::default();
        let spent = CancellationHandle::new(|| {});
        spent.cancel();
        registry.register(spent);
        registry.register(CancellationHandle::new(|| {}));
        // The spent handle was pruned during the second registration.
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_cancellable_aborts_pending_work() {
        let handle = spawn_cancellable(std::future::pending());
        assert!(!handle.is_spent());
        handle.cancel();
        tokio::task::yield_now().await;
        assert!(handle.is_spent());
    }
}
