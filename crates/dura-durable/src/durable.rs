use std::any::Any;

use crate::error::DurableResult;
use crate::handle::Severed;

/// How a durable is being materialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin<'a> {
    /// No stored state exists; build fresh state.
    New,
    /// Rebuild from the state previously returned by
    /// [`Durable::write_state`].
    Loaded(&'a [u8]),
}

impl Origin<'_> {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New)
    }
}

/// A registry-managed, reference-counted, optionally persisted object.
///
/// Implementors hold only their own state. Identity, TTL, deadline,
/// disk presence, and the reference count are tracked by the
/// [`Registry`](crate::Registry), which is the single authority over them.
pub trait Durable: Any + Send + Sync {
    /// Short type name used in log messages.
    fn kind(&self) -> &'static str;

    /// Serialize the type-specific state. Called under the registry lock
    /// while the durable closes with a non-zero TTL.
    fn write_state(&self) -> DurableResult<Vec<u8>>;

    /// Detach every handle this durable holds to other durables.
    ///
    /// Called under the registry lock once the durable's own count reaches
    /// zero. The returned edges are released after the lock is dropped, so
    /// implementations must only move handles out here, via
    /// [`Handle::into_severed`](crate::Handle::into_severed).
    fn sever_dependents(&self) -> Vec<Severed> {
        Vec::new()
    }

    /// The registry dropped the durable: it was destroyed, evicted from the
    /// cache, or closed without caching. Runs under the registry lock before
    /// the id can be opened again, so it must not block. Other `Arc`s to the
    /// object may outlive this call; they must stop touching shared storage.
    fn on_retire(&self) {}

    /// The durable is gone for good (zero-TTL close or expiry). Release any
    /// side storage keyed by its id. Called without the registry lock.
    fn on_discard(&self) {}
}
