use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Sequence number assigned to each update appended to a repository.
///
/// Sequence numbers start at 1; zero is never assigned.
pub type SeqNum = u64;

/// Inclusive range of sequence numbers covered by a data layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeqRange {
    pub lowest: SeqNum,
    pub highest: SeqNum,
}

impl SeqRange {
    /// Build a range, rejecting `lowest > highest`.
    pub fn new(lowest: SeqNum, highest: SeqNum) -> Result<Self, TypeError> {
        if lowest > highest {
            return Err(TypeError::InvertedRange { lowest, highest });
        }
        Ok(Self { lowest, highest })
    }

    /// A range covering exactly one sequence number.
    pub fn single(seq: SeqNum) -> Self {
        Self {
            lowest: seq,
            highest: seq,
        }
    }

    pub fn contains(&self, seq: SeqNum) -> bool {
        self.lowest <= seq && seq <= self.highest
    }

    /// Returns `true` if `other` lies entirely inside this range.
    pub fn covers(&self, other: &SeqRange) -> bool {
        self.lowest <= other.lowest && other.highest <= self.highest
    }

    /// Returns `true` if every number in this range is below every number
    /// in `next`, i.e. the two may sit side by side as neighbors.
    pub fn precedes(&self, next: &SeqRange) -> bool {
        self.highest < next.lowest
    }

    pub fn overlaps(&self, other: &SeqRange) -> bool {
        self.lowest <= other.highest && other.lowest <= self.highest
    }

    /// Smallest range spanning both.
    pub fn span(&self, other: &SeqRange) -> Self {
        Self {
            lowest: self.lowest.min(other.lowest),
            highest: self.highest.max(other.highest),
        }
    }

    pub fn len(&self) -> u64 {
        self.highest - self.lowest + 1
    }
}

impl fmt::Debug for SeqRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqRange({}..={})", self.lowest, self.highest)
    }
}

impl fmt::Display for SeqRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lowest, self.highest)
    }
}
