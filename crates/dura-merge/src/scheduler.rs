use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use dura_types::DurableId;
use tracing::{debug, error, warn};

use crate::config::MergeConfig;
use crate::error::MergeResult;
use crate::queue::{MergeQueue, Poll};
use crate::signal::Wake;
use crate::traits::{Lane, Mergeable};

/// Both merge lanes, shared by the workers and by every repository that
/// schedules itself.
pub struct MergeQueues {
    mem: MergeQueue,
    disk: MergeQueue,
    config: MergeConfig,
}

impl MergeQueues {
    pub fn new(config: MergeConfig) -> Self {
        Self {
            mem: MergeQueue::new(Lane::Mem),
            disk: MergeQueue::new(Lane::Disk),
            config,
        }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn queue(&self, lane: Lane) -> &MergeQueue {
        match lane {
            Lane::Mem => &self.mem,
            Lane::Disk => &self.disk,
        }
    }

    /// Schedule `target` on `lane` unless it is already queued there.
    pub fn enqueue(&self, lane: Lane, key: DurableId, target: Weak<dyn Mergeable>) -> bool {
        self.queue(lane).enqueue(key, target)
    }

    /// Empty both queues. Returns how many members were dropped.
    pub fn clear(&self) -> usize {
        self.mem.clear() + self.disk.clear()
    }

    /// Run one step of `target` on `lane`.
    ///
    /// The next-merge time is pushed out by the lane delay afterwards. A
    /// step that fails or panics is logged and the target is enqueued again,
    /// so no repository silently falls off the schedule.
    pub fn run_step(&self, lane: Lane, target: Arc<dyn Mergeable>) {
        let key = target.merge_key();
        let budget = self.config.budget(lane);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| target.step_merge(lane, budget)));
        target.set_next_merge_time(lane, Instant::now() + self.config.delay(lane));
        match outcome {
            Ok(Ok(())) => debug!(lane = %lane, key = %key, "merge step complete"),
            Ok(Err(err)) => {
                warn!(lane = %lane, key = %key, error = %err, "merge step failed; rescheduled");
                self.enqueue(lane, key, Arc::downgrade(&target));
            }
            Err(_) => {
                error!(lane = %lane, key = %key, "merge step panicked; rescheduled");
                self.enqueue(lane, key, Arc::downgrade(&target));
            }
        }
    }

    /// Poll `lane` once at `now` and run the front member if it is due.
    /// Returns `true` if a step ran.
    pub fn run_due(&self, lane: Lane, now: Instant) -> bool {
        match self.queue(lane).poll(now, self.config.delay(lane)) {
            Poll::Due(target) => {
                self.run_step(lane, target);
                true
            }
            Poll::Empty | Poll::NotDue(_) => false,
        }
    }

    fn close(&self) {
        self.mem.signal().close();
        self.disk.signal().close();
    }
}

impl std::fmt::Debug for MergeQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeQueues")
            .field("mem", &self.mem.len())
            .field("disk", &self.disk.len())
            .finish()
    }
}

/// Worker loop for one lane: wait for a signal or for the front member's
/// next-merge time, then run whatever is due.
fn run_lane(queues: &MergeQueues, lane: Lane) {
    let queue = queues.queue(lane);
    let delay = queues.config.delay(lane);
    let mut sleep_until: Option<Instant> = None;
    loop {
        let wake = match sleep_until.take() {
            Some(at) => queue.signal().wait_until(at),
            None => queue.signal().wait(),
        };
        if wake == Wake::Closed {
            break;
        }
        match queue.poll(Instant::now(), delay) {
            Poll::Empty => {}
            Poll::NotDue(at) => sleep_until = Some(at),
            Poll::Due(target) => queues.run_step(lane, target),
        }
    }
    debug!(lane = %lane, "merge worker stopped");
}

#[derive(Debug)]
struct WorkerHandle {
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    fn stop(&mut self) {
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owns one worker thread per lane.
pub struct MergeScheduler {
    queues: Arc<MergeQueues>,
    workers: Vec<WorkerHandle>,
}

impl MergeScheduler {
    /// Start the mem and disk workers.
    pub fn start(config: MergeConfig) -> MergeResult<Self> {
        let queues = Arc::new(MergeQueues::new(config));
        let mut workers = Vec::with_capacity(Lane::ALL.len());
        for lane in Lane::ALL {
            let worker_queues = Arc::clone(&queues);
            let join = thread::Builder::new()
                .name(format!("dura-merge-{lane}"))
                .spawn(move || run_lane(&worker_queues, lane))?;
            workers.push(WorkerHandle { join: Some(join) });
        }
        debug!(
            mem_delay_ms = queues.config.mem_delay_ms,
            disk_delay_ms = queues.config.disk_delay_ms,
            "merge scheduler started"
        );
        Ok(Self { queues, workers })
    }

    pub fn queues(&self) -> &Arc<MergeQueues> {
        &self.queues
    }

    /// Stop both workers and wait for them. A step in progress finishes
    /// first.
    pub fn shutdown(&mut self) {
        self.queues.close();
        for worker in &mut self.workers {
            worker.stop();
        }
        self.workers.clear();
    }
}

impl Drop for MergeScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for MergeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeScheduler")
            .field("queues", &self.queues)
            .field("workers", &self.workers.len())
            .finish()
    }
}
