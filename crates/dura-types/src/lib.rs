//! Foundation types for the durable-object engine.
//!
//! This crate provides the identity, time, and ordering types shared by the
//! registry, the backing stores, the merge scheduler, and the repositories.
//! Every other `dura-*` crate depends on `dura-types`.
//!
//! # Key Types
//!
//! - [`DurableId`]: UUID v7 identity of a registry-managed object
//! - [`Ttl`]: minimum post-close lifetime of a durable
//! - [`Deadline`]: wall-clock expiry instant computed when a durable closes
//! - [`SeqNum`] / [`SeqRange`]: update sequence numbers and inclusive ranges

pub mod error;
pub mod id;
pub mod seq;
pub mod time;

pub use error::TypeError;
pub use id::DurableId;
pub use seq::{SeqNum, SeqRange};
pub use time::{Deadline, Ttl};
