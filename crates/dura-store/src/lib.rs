//! Backing stores for durable objects.
//!
//! The registry persists a closing durable by handing its blob to a
//! [`BackingStore`] and waiting on a [`Completion`] after it has released its
//! own lock. Stores are internally synchronized and may finish their work on
//! another thread; the only contract is that every accepted request pushes
//! its completion exactly once.
//!
//! # Storage Backends
//!
//! All backends implement the [`BackingStore`] trait:
//!
//! - [`InMemoryBackingStore`] -- `HashMap`-based store that completes inline
//! - [`DirBackingStore`] -- one framed file per durable, written by a
//!   background writer thread
//!
//! # Design Rules
//!
//! 1. A request that returns `Err` never pushes its completion.
//! 2. Requests are applied in submission order per store.
//! 3. Loads observe every save and delete submitted before them, even if the
//!    writer has not reached it yet.
//! 4. The store never interprets blobs.

pub mod completion;
pub mod dir;
pub mod error;
pub mod frame;
pub mod memory;
pub mod record;
pub mod traits;

// Re-export primary types at crate root for ergonomic imports.
pub use completion::Completion;
pub use dir::DirBackingStore;
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryBackingStore;
pub use record::StoredDurable;
pub use traits::BackingStore;
