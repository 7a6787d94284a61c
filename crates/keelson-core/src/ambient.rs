//! Thread-scoped ambient context stack.
//!
//! Lets deeply nested code ask "what is the current X?" (the active batch
//! scope, the host transaction) without threading it through every call.
//! Each payload type has its own slot on the current thread, so pushing a
//! scope never hides the ambient transaction and vice versa.
//!
//! `push` returns a [`ContextGuard`]; releasing it (explicitly or by drop)
//! restores the previous value. Pushes and releases must nest strictly. A
//! release that finds the slot at a different depth than it left it is a
//! protocol violation: [`ContextGuard::release`] reports it, and dropping an
//! unbalanced guard panics. Either way, releasing a frame that still has
//! inner frames on top discards those inner frames too, so the slot never
//! keeps a stale value.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::ExecutionError;

type Payload = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct Slot {
    depth: usize,
    top: Option<Payload>,
}

thread_local! {
    static SLOTS: RefCell<HashMap<TypeId, Slot>> = RefCell::new(HashMap::new());
}

/// Install `context` as the current value of type `T` on this thread.
pub fn push<T: Any + Send + Sync>(context: Arc<T>) -> ContextGuard {
    let type_id = TypeId::of::<T>();
    let (previous, depth) = SLOTS.with(|slots| {
        let mut slots = slots.borrow_mut();
        let slot = slots.entry(type_id).or_default();
        slot.depth += 1;
        let previous = slot.top.replace(context as Payload);
        (previous, slot.depth)
    });

    ContextGuard {
        type_id,
        type_name: std::any::type_name::<T>(),
        previous,
        depth,
        released: false,
        _not_send: PhantomData,
    }
}

/// The current value of type `T` on this thread, if any is active.
pub fn retrieve<T: Any + Send + Sync>() -> Option<Arc<T>> {
    SLOTS.with(|slots| {
        slots
            .borrow()
            .get(&TypeId::of::<T>())
            .and_then(|slot| slot.top.clone())
            .and_then(|payload| payload.downcast::<T>().ok())
    })
}

/// Nesting depth of type `T` on this thread (0 when nothing is active).
pub fn depth<T: Any + Send + Sync>() -> usize {
    SLOTS.with(|slots| {
        slots
            .borrow()
            .get(&TypeId::of::<T>())
            .map_or(0, |slot| slot.depth)
    })
}

// ---------------------------------------------------------------------------
// ContextGuard
// ---------------------------------------------------------------------------

/// Scoped handle for one `push`. Not `Send`: it must be released on the thread
/// that created it.
#[must_use = "the context is released as soon as the guard is dropped"]
pub struct ContextGuard {
    type_id: TypeId,
    type_name: &'static str,
    previous: Option<Payload>,
    depth: usize,
    released: bool,
    _not_send: PhantomData<Rc<()>>,
}

impl ContextGuard {
    /// Release the context, restoring the previous value.
    ///
    /// Returns `ProtocolMisuse` if an inner push on this thread is still
    /// active (or was already released out of order). Leaked inner frames are
    /// discarded along with this one.
    pub fn release(mut self) -> Result<(), ExecutionError> {
        self.released = true;
        self.restore()
    }

    fn restore(&mut self) -> Result<(), ExecutionError> {
        let previous = self.previous.take();
        SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            let slot = slots.entry(self.type_id).or_default();
            let found = slot.depth;
            // Below our depth means this frame was already unwound.
            if found >= self.depth {
                slot.depth = self.depth - 1;
                slot.top = previous;
                if slot.depth == 0 {
                    slots.remove(&self.type_id);
                }
            } else if found == 0 {
                slots.remove(&self.type_id);
            }
            if found != self.depth {
                return Err(ExecutionError::misuse(format!(
                    "ambient context for {} released at depth {} but pushed at depth {}",
                    self.type_name, found, self.depth
                )));
            }
            Ok(())
        })
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.restore() {
            if !std::thread::panicking() {
                panic!("{err}");
            }
        }
    }
}

impl std::fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextGuard")
            .field("type", &self.type_name)
            .field("depth", &self.depth)
            .finish()
    }
}
