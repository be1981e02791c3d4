use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::StoreResult;

enum State<T> {
    Pending,
    Done(StoreResult<T>),
    Taken,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

/// One-shot completion signal for an asynchronous store request.
///
/// The requester keeps one clone and waits on it; the store keeps another
/// and pushes the outcome once the work is done. The shared state is freed
/// by whichever side drops last, so neither side has to outlive the other.
pub struct Completion<T = ()> {
    inner: Arc<Inner<T>>,
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending),
                ready: Condvar::new(),
            }),
        }
    }

    /// Record the outcome and wake the waiter.
    ///
    /// Panics if the completion was already pushed: a store that finishes a
    /// request twice has a bookkeeping bug.
    pub fn push(&self, result: StoreResult<T>) {
        let mut state = self.inner.state.lock().expect("completion mutex poisoned");
        assert!(
            matches!(*state, State::Pending),
            "completion pushed more than once"
        );
        *state = State::Done(result);
        self.inner.ready.notify_all();
    }

    /// Returns `true` once the outcome has been pushed.
    pub fn is_done(&self) -> bool {
        !matches!(
            *self.inner.state.lock().expect("completion mutex poisoned"),
            State::Pending
        )
    }

    /// Block until the outcome is pushed, then take it.
    pub fn wait(self) -> StoreResult<T> {
        let mut state = self.inner.state.lock().expect("completion mutex poisoned");
        loop {
            match std::mem::replace(&mut *state, State::Taken) {
                State::Done(result) => return result,
                State::Pending => {
                    *state = State::Pending;
                    state = self
                        .inner
                        .ready
                        .wait(state)
                        .expect("completion mutex poisoned");
                }
                State::Taken => panic!("completion waited on more than once"),
            }
        }
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_done())
            .finish()
    }
}
