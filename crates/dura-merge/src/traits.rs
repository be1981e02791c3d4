use std::fmt;
use std::time::Instant;

use dura_types::DurableId;
use serde::{Deserialize, Serialize};

use crate::error::MergeResult;

/// Which merge pipeline a queue or step belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lane {
    Mem,
    Disk,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Mem, Lane::Disk];
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mem => write!(f, "mem"),
            Self::Disk => write!(f, "disk"),
        }
    }
}

/// A repository the scheduler can merge.
///
/// The scheduler guarantees that a given key is a member of each queue at
/// most once and that a popped member is not handed to a second worker until
/// it is enqueued again, so at most one step per lane runs per repository.
pub trait Mergeable: Send + Sync {
    /// Identity used for queue membership.
    fn merge_key(&self) -> DurableId;

    /// Earliest time the next step on `lane` may run.
    fn next_merge_time(&self, lane: Lane) -> Instant;

    fn set_next_merge_time(&self, lane: Lane, at: Instant);

    /// Fold in-memory layers. An error keeps the repository scheduled.
    fn step_merge_mem(&self) -> MergeResult<()>;

    /// Fold on-disk layers using at most `budget` block slots.
    fn step_merge_disk(&self, budget: usize) -> MergeResult<()>;

    /// Dispatch to the step for `lane`.
    fn step_merge(&self, lane: Lane, budget: usize) -> MergeResult<()> {
        match lane {
            Lane::Mem => self.step_merge_mem(),
            Lane::Disk => self.step_merge_disk(budget),
        }
    }
}
