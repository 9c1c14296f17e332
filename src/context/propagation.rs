use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{trace, warn};

use super::{Context, ContextStorage, CoroutineLocalStorage};
use crate::error::{BrokerError, Result};

/// Service owning the current-context slot.
///
/// Brokers receive a propagator at construction instead of reaching for a
/// process-wide holder, so each test (or each broker) can use its own slot.
/// Cloning is cheap and clones share the same storage.
#[derive(Clone)]
pub struct ContextPropagator {
    storage: Arc<dyn ContextStorage>,
}

impl ContextPropagator {
    /// Create a propagator over the given storage strategy.
    pub fn new(storage: Arc<dyn ContextStorage>) -> Self {
        Self { storage }
    }

    /// Create a propagator with a fresh per-coroutine slot.
    #[must_use]
    pub fn local() -> Self {
        Self::new(Arc::new(CoroutineLocalStorage::new()))
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn ContextStorage> {
        &self.storage
    }

    /// The current context.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NoContext`] when nothing has been set on this thread of control.
    pub fn current(&self) -> Result<Context> {
        self.storage.get().ok_or(BrokerError::NoContext)
    }

    #[must_use]
    pub fn try_current(&self) -> Option<Context> {
        self.storage.get()
    }

    /// Install `context` as the current context.
    pub fn set(&self, context: Context) {
        self.storage.set(Some(context));
    }

    /// Clear the current context. Call before a thread goes back to a pool.
    pub fn reset(&self) {
        self.storage.reset();
    }

    /// An independent copy of the current context, for handing to another thread.
    #[must_use]
    pub fn snapshot(&self) -> Option<Context> {
        self.storage.get().map(|ctx| ctx.copy())
    }

    /// Install `context` until the returned guard is dropped.
    ///
    /// The guard puts back whatever the slot held before, or clears it when it
    /// was empty, on every exit path including unwinding.
    #[must_use = "the context is removed as soon as the scope is dropped"]
    pub fn enter(&self, context: Option<Context>) -> ContextScope {
        let previous = self.storage.get();
        trace!(
            has_context = context.is_some(),
            had_previous = previous.is_some(),
            "Entering context scope"
        );
        self.storage.set(context);
        ContextScope {
            storage: Arc::clone(&self.storage),
            previous,
            _not_send: PhantomData,
        }
    }

    /// Install `context` on a pooled worker until the guard is dropped.
    ///
    /// Unlike [`enter`](Self::enter) the guard always leaves the slot empty,
    /// so a context left behind by earlier work is discarded instead of being
    /// handed to whatever the worker runs next.
    #[must_use = "the context is removed as soon as the scope is dropped"]
    pub fn enter_isolated(&self, context: Option<Context>) -> ContextScope {
        if self.storage.get().is_some() {
            warn!("Discarding context left behind on worker");
        }
        self.storage.set(context);
        ContextScope {
            storage: Arc::clone(&self.storage),
            previous: None,
            _not_send: PhantomData,
        }
    }

    /// Run `f` with `context` installed, clearing it afterwards.
    pub fn scoped<T>(&self, context: Option<Context>, f: impl FnOnce() -> T) -> T {
        let _scope = self.enter(context);
        f()
    }

    /// Capture the current context now and return a closure that runs `f`
    /// with an independent copy of it installed, wherever it is called.
    pub fn propagate<F, T>(&self, f: F) -> impl FnOnce() -> T + Send + 'static
    where
        F: FnOnce() -> T + Send + 'static,
        T: 'static,
    {
        let snapshot = self.snapshot();
        let propagator = self.clone();
        move || propagator.scoped(snapshot, f)
    }
}

impl Default for ContextPropagator {
    fn default() -> Self {
        Self::local()
    }
}

impl fmt::Debug for ContextPropagator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPropagator")
            .field("current", &self.storage.get())
            .finish()
    }
}

/// Guard returned by [`ContextPropagator::enter`] and
/// [`ContextPropagator::enter_isolated`].
///
/// Thread-confined: it restores the slot of the thread that created it.
pub struct ContextScope {
    storage: Arc<dyn ContextStorage>,
    previous: Option<Context>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(previous) => self.storage.set(Some(previous)),
            None => self.storage.reset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SharedStorage;

    #[test]
    fn test_current_fails_when_unset() {
        let propagator = ContextPropagator::local();
        assert!(matches!(propagator.current(), Err(BrokerError::NoContext)));
        assert!(propagator.try_current().is_none());
    }

    #[test]
    fn test_set_and_reset() {
        let propagator = ContextPropagator::local();
        propagator.set(Context::new());
        assert!(propagator.current().is_ok());
        propagator.reset();
        assert!(propagator.current().is_err());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let propagator = ContextPropagator::local();
        let ctx = Context::new();
        ctx.set_serializable("user", Some("ada".to_string()));
        propagator.set(ctx.clone());

        let snapshot = propagator.snapshot().unwrap();
        snapshot.set_serializable::<String>("user", None);
        assert!(ctx.contains("user"));
        propagator.reset();
    }

    #[test]
    fn test_scope_clears_slot_on_drop() {
        let propagator = ContextPropagator::local();
        {
            let _scope = propagator.enter(Some(Context::new()));
            assert!(propagator.current().is_ok());
        }
        assert!(propagator.current().is_err());
    }

    #[test]
    fn test_scope_restores_previous() {
        let propagator = ContextPropagator::local();
        let outer = Context::new();
        propagator.set(outer.clone());
        {
            let inner = Context::new();
            let _scope = propagator.enter(Some(inner.clone()));
            assert!(propagator.current().unwrap().same_as(&inner));
        }
        assert!(propagator.current().unwrap().same_as(&outer));
        propagator.reset();
    }

    #[test]
    fn test_isolated_scope_discards_leftover_context() {
        let propagator = ContextPropagator::local();
        propagator.set(Context::new());
        {
            let fresh = Context::new();
            let _scope = propagator.enter_isolated(Some(fresh.clone()));
            assert!(propagator.current().unwrap().same_as(&fresh));
        }
        assert!(propagator.try_current().is_none());
    }

    #[test]
    fn test_scope_clears_slot_on_panic() {
        let propagator = ContextPropagator::local();
        let inner = propagator.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            inner.scoped::<()>(Some(Context::new()), || panic!("handler blew up"));
        }));
        assert!(result.is_err());
        assert!(propagator.try_current().is_none());
    }

    #[test]
    fn test_propagate_carries_copy_to_other_thread() {
        let propagator = ContextPropagator::local();
        let ctx = Context::new();
        ctx.set_serializable("tenant", Some("acme".to_string()));
        propagator.set(ctx.clone());

        let observer = propagator.clone();
        let job = propagator.propagate(move || {
            let current = observer.current().unwrap();
            current.set_serializable("worker", Some(true));
            let tenant = current.get_as::<String>("tenant").map(|t| (*t).clone());
            (tenant, current.same_as(&ctx))
        });
        let leak_check = propagator.clone();
        let (tenant, same) = std::thread::spawn(move || {
            let out = job();
            assert!(leak_check.try_current().is_none());
            out
        })
        .join()
        .unwrap();

        assert_eq!(tenant.as_deref(), Some("acme"));
        assert!(!same);
        assert!(!propagator.current().unwrap().contains("worker"));
        propagator.reset();
    }

    #[test]
    fn test_shared_storage_propagator() {
        let propagator = ContextPropagator::new(Arc::new(SharedStorage::new()));
        propagator.set(Context::new());
        let other = propagator.clone();
        let seen = std::thread::spawn(move || other.try_current().is_some())
            .join()
            .unwrap();
        assert!(seen);
        propagator.reset();
    }
}
