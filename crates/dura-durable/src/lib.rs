//! Durable objects and their registry.
//!
//! A durable is a registry-managed, reference-counted, optionally persisted
//! object. Callers obtain a [`Handle`] from the [`Registry`]; while any handle
//! exists the durable is open. Dropping the last handle closes it: a durable
//! with a non-zero TTL is persisted and kept in a deadline-ordered cache, one
//! with a zero TTL is deleted and destroyed on the spot.
//!
//! # Key Types
//!
//! - [`Durable`]: trait implemented by every registry-managed object
//! - [`Handle`]: counted reference; the last drop runs the close protocol
//! - [`Severed`]: a dependent edge detached from its owner, released later
//! - [`Registry`]: openable map, closed cache, and the open/close state machine
//! - [`RegistryConfig`]: cache bound

pub mod config;
pub mod durable;
pub mod envelope;
pub mod error;
pub mod handle;
pub mod registry;

pub use config::RegistryConfig;
pub use durable::{Durable, Origin};
pub use error::{DurableError, DurableResult, Location};
pub use handle::{Handle, Severed};
pub use registry::{CleanReport, Registry};
