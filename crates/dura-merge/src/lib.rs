//! Merge scheduling for mergeable repositories.
//!
//! Two independent pipelines fold a repository's layers together: the memory
//! lane merges recent in-memory writes (cheap, frequent) and the disk lane
//! merges on-disk generations (I/O bound, limited by a block-slot budget).
//! Each lane owns a [`MergeQueue`] ordered by insertion and one worker
//! thread. Workers check each member's next-merge time lazily and sleep
//! until it comes due instead of polling.
//!
//! # Key Types
//!
//! - [`Mergeable`]: what the scheduler needs from a repository
//! - [`Lane`]: memory or disk pipeline
//! - [`MergeQueue`]: exclusive-membership delay queue with a wake signal
//! - [`MergeQueues`]: both lanes, shared with the repositories that enqueue
//! - [`MergeScheduler`]: owns the worker threads

pub mod config;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod signal;
pub mod traits;

pub use config::MergeConfig;
pub use error::{MergeError, MergeResult};
pub use queue::{MergeQueue, Poll};
pub use scheduler::{MergeQueues, MergeScheduler};
pub use signal::WakeSignal;
pub use traits::{Lane, Mergeable};
