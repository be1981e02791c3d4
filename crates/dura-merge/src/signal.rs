use std::sync::{Condvar, Mutex};
use std::time::Instant;

/// Why a wait on a [`WakeSignal`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wake {
    /// A permit was consumed.
    Signalled,
    /// The deadline passed without a permit.
    TimedOut,
    /// The signal was closed; the waiter should exit.
    Closed,
}

struct Permits {
    count: usize,
    closed: bool,
}

/// Counting wake-up signal: `push` adds a permit and wakes one waiter,
/// `wait` blocks until it can take one.
pub struct WakeSignal {
    permits: Mutex<Permits>,
    cond: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self {
            permits: Mutex::new(Permits {
                count: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self) {
        let mut permits = self.permits.lock().expect("wake signal mutex poisoned");
        permits.count += 1;
        self.cond.notify_one();
    }

    /// Wake every waiter for good.
    pub fn close(&self) {
        let mut permits = self.permits.lock().expect("wake signal mutex poisoned");
        permits.closed = true;
        self.cond.notify_all();
    }

    /// Block until a permit is available.
    pub fn wait(&self) -> Wake {
        let mut permits = self.permits.lock().expect("wake signal mutex poisoned");
        loop {
            if permits.closed {
                return Wake::Closed;
            }
            if permits.count > 0 {
                permits.count -= 1;
                return Wake::Signalled;
            }
            permits = self.cond.wait(permits).expect("wake signal mutex poisoned");
        }
    }

    /// Block until a permit is available or `deadline` passes.
    pub fn wait_until(&self, deadline: Instant) -> Wake {
        let mut permits = self.permits.lock().expect("wake signal mutex poisoned");
        loop {
            if permits.closed {
                return Wake::Closed;
            }
            if permits.count > 0 {
                permits.count -= 1;
                return Wake::Signalled;
            }
            let now = Instant::now();
            if now >= deadline {
                return Wake::TimedOut;
            }
            let (next, _) = self
                .cond
                .wait_timeout(permits, deadline - now)
                .expect("wake signal mutex poisoned");
            permits = next;
        }
    }

    /// Permits pushed but not yet taken.
    pub fn available(&self) -> usize {
        self.permits.lock().expect("wake signal mutex poisoned").count
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WakeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeSignal")
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn permits_are_counted() {
        let signal = WakeSignal::new();
        signal.push();
        signal.push();
        assert_eq!(signal.available(), 2);
        assert_eq!(signal.wait(), Wake::Signalled);
        assert_eq!(signal.wait(), Wake::Signalled);
        assert_eq!(signal.available(), 0);
    }

    #[test]
    fn wait_until_times_out() {
        let signal = WakeSignal::new();
        let start = Instant::now();
        assert_eq!(signal.wait_until(start + Duration::from_millis(20)), Wake::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn push_wakes_sleeper() {
        let signal = Arc::new(WakeSignal::new());
        let pusher = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            pusher.push();
        });
        let woke = signal.wait_until(Instant::now() + Duration::from_secs(5));
        assert_eq!(woke, Wake::Signalled);
        handle.join().unwrap();
    }

    #[test]
    fn close_releases_waiters() {
        let signal = Arc::new(WakeSignal::new());
        let waiter = Arc::clone(&signal);
        let handle = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(10));
        signal.close();
        assert_eq!(handle.join().unwrap(), Wake::Closed);
    }
}
