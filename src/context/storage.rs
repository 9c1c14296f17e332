use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::Context;

/// Where the current context of a thread of control is kept.
///
/// Implementations decide what "current" means: one slot per coroutine,
/// one slot for the whole process, a slot per test case...
pub trait ContextStorage: Send + Sync {
    /// The current context, or `None` when the slot is empty.
    fn get(&self) -> Option<Context>;

    /// Replace the slot's content. `None` empties the slot.
    fn set(&self, context: Option<Context>);

    /// Empty the slot.
    fn reset(&self);
}

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

// Keyed by storage instance so independent propagators never see each other's slot.
type Slots = RefCell<HashMap<u64, Context>>;

may::coroutine_local!(static COROUTINE_SLOTS: Slots = RefCell::new(HashMap::new()));

thread_local! {
    static THREAD_SLOTS: Slots = RefCell::new(HashMap::new());
}

/// Run `f` against the slot map of the current coroutine, or of the current
/// thread outside a coroutine. `None` once the thread's map is torn down.
fn with_slots<R>(f: impl FnOnce(&Slots) -> R) -> Option<R> {
    if may::coroutine::is_coroutine() {
        Some(COROUTINE_SLOTS.with(f))
    } else {
        THREAD_SLOTS.try_with(f).ok()
    }
}

/// One slot per coroutine, or per OS thread outside a coroutine (the default
/// strategy).
///
/// A `may` coroutine keeps its own slot when it parks and resumes on another
/// worker thread, and never sees the slot of a coroutine that happened to run
/// on the same thread. Coroutine slots are freed with the coroutine.
///
/// Each instance owns its own cell in every coroutine, so two propagators
/// built from two instances are fully isolated. Dropping an instance clears
/// its cell in the coroutine or thread doing the drop.
#[derive(Debug)]
pub struct CoroutineLocalStorage {
    id: u64,
}

impl CoroutineLocalStorage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for CoroutineLocalStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextStorage for CoroutineLocalStorage {
    fn get(&self) -> Option<Context> {
        with_slots(|slots| slots.borrow().get(&self.id).cloned()).flatten()
    }

    fn set(&self, context: Option<Context>) {
        match context {
            Some(context) => {
                with_slots(|slots| {
                    slots.borrow_mut().insert(self.id, context);
                });
            }
            None => self.reset(),
        }
    }

    fn reset(&self) {
        with_slots(|slots| {
            slots.borrow_mut().remove(&self.id);
        });
    }
}

impl Drop for CoroutineLocalStorage {
    fn drop(&mut self) {
        self.reset();
    }
}

/// A single slot shared by every thread.
///
/// Suitable for single-threaded runtimes and for tests that want to observe
/// the slot from outside the thread that set it.
#[derive(Debug, Default)]
pub struct SharedStorage {
    slot: Mutex<Option<Context>>,
}

impl SharedStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContextStorage for SharedStorage {
    fn get(&self) -> Option<Context> {
        self.slot.lock().clone()
    }

    fn set(&self, context: Option<Context>) {
        *self.slot.lock() = context;
    }

    fn reset(&self) {
        *self.slot.lock() = None;
    }
}
