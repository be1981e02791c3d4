use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dura_types::DurableId;
use tracing::trace;

use crate::signal::WakeSignal;
use crate::traits::{Lane, Mergeable};

struct Member {
    key: DurableId,
    target: Weak<dyn Mergeable>,
}

#[derive(Default)]
struct Members {
    order: VecDeque<Member>,
    keys: HashSet<DurableId>,
}

/// Result of peeking at the front of a [`MergeQueue`].
pub enum Poll {
    Empty,
    /// The front member is not due until the given instant. It stays queued.
    NotDue(Instant),
    /// The front member was due and has been popped.
    Due(Arc<dyn Mergeable>),
}

/// Delay queue for one merge lane.
///
/// Members are kept in insertion order and each key appears at most once.
/// Targets are held weakly: a repository destroyed while queued is dropped
/// from the queue the next time it reaches the front.
pub struct MergeQueue {
    lane: Lane,
    members: Mutex<Members>,
    signal: WakeSignal,
}

impl MergeQueue {
    pub fn new(lane: Lane) -> Self {
        Self {
            lane,
            members: Mutex::new(Members::default()),
            signal: WakeSignal::new(),
        }
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    pub fn signal(&self) -> &WakeSignal {
        &self.signal
    }

    /// Append `target` unless `key` is already a member. Returns `true` if
    /// it was inserted.
    ///
    /// A member whose target has vanished keeps its place but takes over the
    /// new target, so a repository reopened under the same id stays queued.
    pub fn enqueue(&self, key: DurableId, target: Weak<dyn Mergeable>) -> bool {
        {
            let mut members = self.members.lock().expect("lock poisoned");
            if !members.keys.insert(key) {
                if let Some(member) = members.order.iter_mut().find(|m| m.key == key) {
                    if member.target.strong_count() == 0 {
                        member.target = target;
                    }
                }
                return false;
            }
            members.order.push_back(Member { key, target });
        }
        trace!(lane = %self.lane, key = %key, "enqueued for merge");
        self.signal.push();
        true
    }

    pub fn contains(&self, key: &DurableId) -> bool {
        self.members.lock().expect("lock poisoned").keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.members.lock().expect("lock poisoned").order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every member. Returns how many were queued.
    pub fn clear(&self) -> usize {
        let mut members = self.members.lock().expect("lock poisoned");
        let count = members.order.len();
        members.order.clear();
        members.keys.clear();
        count
    }

    /// Look at the first-queued member. If its next-merge time has come,
    /// push that time out by `delay`, pop it, and hand it back.
    pub fn poll(&self, now: Instant, delay: Duration) -> Poll {
        let mut members = self.members.lock().expect("lock poisoned");
        loop {
            let Some(front) = members.order.front() else {
                return Poll::Empty;
            };
            let key = front.key;
            let Some(target) = front.target.upgrade() else {
                members.order.pop_front();
                members.keys.remove(&key);
                trace!(lane = %self.lane, key = %key, "dropped vanished merge target");
                continue;
            };
            let due = target.next_merge_time(self.lane);
            if due > now {
                return Poll::NotDue(due);
            }
            target.set_next_merge_time(self.lane, now + delay);
            members.order.pop_front();
            members.keys.remove(&key);
            if !members.order.is_empty() {
                self.signal.push();
            }
            return Poll::Due(target);
        }
    }
}

impl std::fmt::Debug for MergeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeQueue")
            .field("lane", &self.lane)
            .field("len", &self.len())
            .finish()
    }
}
