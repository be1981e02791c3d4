use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use dura_types::{DurableId, Ttl};

use crate::durable::Durable;
use crate::registry::Shared;

/// Counted reference to an open durable of type `T`.
///
/// Cloning increments the durable's reference count under the registry lock;
/// dropping decrements it, and the drop that reaches zero runs the close
/// protocol on the dropping thread.
pub struct Handle<T: Durable> {
    object: Arc<T>,
    id: DurableId,
    shared: Arc<Shared>,
    armed: bool,
}

impl<T: Durable> Handle<T> {
    /// Wrap a count that the registry has already taken on our behalf.
    pub(crate) fn adopt(object: Arc<T>, id: DurableId, shared: Arc<Shared>) -> Self {
        Self {
            object,
            id,
            shared,
            armed: true,
        }
    }

    pub fn id(&self) -> DurableId {
        self.id
    }

    /// Current TTL of the durable.
    pub fn ttl(&self) -> Ttl {
        self.shared.ttl_of(&self.id)
    }

    /// Change the TTL applied when the durable next closes.
    pub fn set_ttl(&self, ttl: Ttl) {
        self.shared.set_ttl(&self.id, ttl);
    }

    /// Number of live handles to this durable, this one included.
    pub fn ref_count(&self) -> usize {
        self.shared.ref_count_of(&self.id)
    }

    #[cfg(test)]
    pub(crate) fn as_arc(&self) -> &Arc<T> {
        &self.object
    }

    /// Returns `true` if both handles reference the same object.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.object, &b.object)
    }

    /// Detach this handle without decrementing the count.
    ///
    /// Used by [`Durable::sever_dependents`] while the registry lock is held;
    /// the returned [`Severed`] performs the decrement once released.
    pub fn into_severed(mut self) -> Severed {
        self.armed = false;
        Severed {
            id: self.id,
            shared: Arc::clone(&self.shared),
            pending: true,
        }
    }
}

impl<T: Durable> Clone for Handle<T> {
    fn clone(&self) -> Self {
        self.shared.acquire(&self.id);
        Self::adopt(Arc::clone(&self.object), self.id, Arc::clone(&self.shared))
    }
}

impl<T: Durable> Drop for Handle<T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release(self.id);
        }
    }
}

impl<T: Durable> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.object
    }
}

impl<T: Durable> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("kind", &self.object.kind())
            .finish()
    }
}

/// A dependent edge cut from its owner but not yet released.
///
/// Holds one count on the dependent durable. [`Severed::release`] (or
/// dropping the value) gives it back, which runs the dependent's close
/// protocol if it was the last count.
#[must_use = "a severed edge still holds a count until released"]
pub struct Severed {
    id: DurableId,
    shared: Arc<Shared>,
    pending: bool,
}

impl Severed {
    pub fn id(&self) -> DurableId {
        self.id
    }

    pub fn release(mut self) {
        self.pending = false;
        self.shared.release(self.id);
    }
}

impl Drop for Severed {
    fn drop(&mut self) {
        if self.pending {
            self.shared.release(self.id);
        }
    }
}

impl fmt::Debug for Severed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Severed").field("id", &self.id).finish()
    }
}
