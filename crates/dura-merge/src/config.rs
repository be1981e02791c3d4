use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::traits::Lane;

/// Tuning for both merge lanes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Minimum spacing between memory merges of one repository.
    pub mem_delay_ms: u64,
    /// Minimum spacing between disk merges of one repository.
    pub disk_delay_ms: u64,
    /// Block slots a single disk merge may hold open.
    pub block_slots_per_merger: usize,
    /// Disk layer count at which a repository schedules a disk merge.
    pub disk_merge_threshold: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            mem_delay_ms: 50,
            disk_delay_ms: 250,
            block_slots_per_merger: 16,
            disk_merge_threshold: 3,
        }
    }
}

impl MergeConfig {
    pub fn delay(&self, lane: Lane) -> Duration {
        match lane {
            Lane::Mem => Duration::from_millis(self.mem_delay_ms),
            Lane::Disk => Duration::from_millis(self.disk_delay_ms),
        }
    }

    /// Budget handed to each step of `lane`.
    pub fn budget(&self, lane: Lane) -> usize {
        match lane {
            Lane::Mem => 0,
            Lane::Disk => self.block_slots_per_merger,
        }
    }
}
