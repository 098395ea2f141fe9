//! One-shot shared completion: one producer, many blocking consumers.
//!
//! An entry being filled, or a coalesced load in flight, carries at most one
//! [`SharedPromise`]; every thread that decides to wait takes a
//! [`SharedFuture`] from it. Fulfilment wakes all waiters exactly once. The
//! value is a plain bool meaning "re-check now": waiters re-probe the cache
//! rather than trusting the producer's outcome.

use std::time::{Duration, Instant};

use crate::sync::{Arc, Condvar, Mutex};

struct Shared {
    value: Mutex<Option<bool>>,
    cv: Condvar,
}

/// The producer half. Dropping an unfulfilled promise fulfils it with
/// `false` so waiters can never be stranded.
pub struct SharedPromise {
    shared: Arc<Shared>,
}

impl Default for SharedPromise {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedPromise {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                value: Mutex::new(None),
                cv: Condvar::new(),
            }),
        }
    }

    /// A future resolving when this promise is fulfilled. May be called any
    /// number of times.
    pub fn future(&self) -> SharedFuture {
        SharedFuture {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Fulfil the promise, waking every waiter. One-shot: consumes self.
    pub fn set_value(self, value: bool) {
        self.fulfill(value);
    }

    fn fulfill(&self, value: bool) {
        let mut state = self.shared.value.lock().unwrap();
        if state.is_none() {
            *state = Some(value);
            self.shared.cv.notify_all();
        }
    }
}

impl Drop for SharedPromise {
    fn drop(&mut self) {
        self.fulfill(false);
    }
}

impl std::fmt::Debug for SharedPromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedPromise")
    }
}

/// The consumer half. Cloneable; all clones resolve to the same value.
#[derive(Clone)]
pub struct SharedFuture {
    shared: Arc<Shared>,
}

impl SharedFuture {
    /// Block until the promise is fulfilled.
    pub fn wait(&self) -> bool {
        let mut state = self.shared.value.lock().unwrap();
        loop {
            if let Some(value) = *state {
                return value;
            }
            state = self.shared.cv.wait(state).unwrap();
        }
    }

    /// Block until fulfilment or until `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.value.lock().unwrap();
        loop {
            if let Some(value) = *state {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .shared
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
    }

    /// The value if already fulfilled, without blocking.
    pub fn try_value(&self) -> Option<bool> {
        *self.shared.value.lock().unwrap()
    }
}

impl std::fmt::Debug for SharedFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedFuture(ready: {})", self.try_value().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::thread;

    #[test]
    fn test_set_before_wait() {
        let promise = SharedPromise::new();
        let future = promise.future();
        promise.set_value(true);
        assert_eq!(future.try_value(), Some(true));
        assert!(future.wait());
    }

    #[test]
    fn test_many_waiters_woken_once() {
        let promise = SharedPromise::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let future = promise.future();
            handles.push(thread::spawn(move || future.wait()));
        }
        promise.set_value(true);
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }

    #[test]
    fn test_dropped_promise_wakes_with_false() {
        let promise = SharedPromise::new();
        let future = promise.future();
        drop(promise);
        assert!(!future.wait());
    }

    #[test]
    fn test_wait_timeout() {
        let promise = SharedPromise::new();
        let future = promise.future();
        assert_eq!(future.wait_timeout(Duration::from_millis(10)), None);
        promise.set_value(true);
        assert_eq!(future.wait_timeout(Duration::from_millis(10)), Some(true));
    }

    #[cfg(feature = "shuttle")]
    #[test]
    fn shuttle_promise_handoff() {
        crate::utils::shuttle_test(|| {
            let promise = SharedPromise::new();
            let future = promise.future();
            let producer = thread::spawn(move || promise.set_value(true));
            assert!(future.wait());
            producer.join().unwrap();
        });
    }
}
