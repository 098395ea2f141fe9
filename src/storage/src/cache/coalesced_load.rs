//! Coalesced loads: many readers waiting on a single in-flight fetch that
//! covers multiple entries.

use crate::CacheError;
use crate::sync::Mutex;

use super::pin::CachePin;
use super::promise::{SharedFuture, SharedPromise};

/// Lifecycle of a coalesced load. One-shot: `Planned` is left exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Planned,
    Loading,
    Loaded,
    Cancelled,
}

/// Fetches the data of a coalesced load.
pub trait CoalescedLoader: Send + Sync {
    /// Fetch the covered regions and fill their entries, returning the
    /// exclusive pins it filled. `immediate` is true when no caller is
    /// waiting for the result, e.g. a prefetch sweep.
    fn load_data(&self, immediate: bool) -> Result<Vec<CachePin>, CacheError>;
}

struct LoadInner {
    state: LoadState,
    promise: Option<SharedPromise>,
}

/// A one-shot transaction that fetches several entries in one IO batch and
/// publishes them together. Whoever finds it `Planned` runs the load; later
/// arrivals either get a future or are told to come back.
///
/// Dropping a load in flight forces `Cancelled`, so leaked waiters wake and
/// re-probe the cache.
pub struct CoalescedLoad {
    inner: Mutex<LoadInner>,
    loader: Box<dyn CoalescedLoader>,
}

impl CoalescedLoad {
    pub fn new(loader: Box<dyn CoalescedLoader>) -> Self {
        Self {
            inner: Mutex::new(LoadInner {
                state: LoadState::Planned,
                promise: None,
            }),
            loader,
        }
    }

    pub fn state(&self) -> LoadState {
        self.inner.lock().unwrap().state
    }

    /// Run the load, or arrange to learn of its completion.
    ///
    /// Returns `Ok(true)` when the data is settled (loaded or cancelled;
    /// either way, probe the cache). Returns `Ok(false)` when the load is
    /// running on another thread; with `wait` supplied, it receives a future
    /// resolving when the entries are published. A loader failure cancels
    /// the load, wakes waiters, and propagates.
    pub fn load_or_future(
        &self,
        wait: Option<&mut Option<SharedFuture>>,
    ) -> Result<bool, CacheError> {
        let immediate = wait.is_none();
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                LoadState::Cancelled | LoadState::Loaded => return Ok(true),
                LoadState::Loading => {
                    if let Some(wait) = wait {
                        *wait = Some(
                            inner
                                .promise
                                .get_or_insert_with(SharedPromise::new)
                                .future(),
                        );
                    }
                    return Ok(false);
                }
                LoadState::Planned => inner.state = LoadState::Loading,
            }
        }
        // Outside the mutex.
        match self.loader.load_data(immediate) {
            Ok(pins) => {
                for pin in &pins {
                    let entry = pin.checked_entry();
                    assert!(entry.key().is_some(), "loaded entry has no key");
                    assert!(entry.is_exclusive(), "loaded entry is not exclusive");
                    entry.set_exclusive_to_shared();
                }
                drop(pins);
                self.set_end_state(LoadState::Loaded);
                Ok(true)
            }
            Err(error) => {
                self.set_end_state(LoadState::Cancelled);
                Err(error)
            }
        }
    }

    fn set_end_state(&self, end_state: LoadState) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = end_state;
        if let Some(promise) = inner.promise.take() {
            promise.set_value(true);
        }
    }
}

impl Drop for CoalescedLoad {
    fn drop(&mut self) {
        // Continue possibly waiting threads.
        self.set_end_state(LoadState::Cancelled);
    }
}

impl std::fmt::Debug for CoalescedLoad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CoalescedLoad({:?})", self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::atomic::{AtomicUsize, Ordering};
    use crate::sync::{Arc, thread};

    struct CountingLoader {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl CoalescedLoader for CountingLoader {
        fn load_data(&self, _immediate: bool) -> Result<Vec<CachePin>, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CacheError::LoadFailed("backing store unreachable".into()))
            } else {
                Ok(Vec::new())
            }
        }
    }

    fn counting_load(fail: bool) -> (CoalescedLoad, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let load = CoalescedLoad::new(Box::new(CountingLoader {
            calls: Arc::clone(&calls),
            fail,
        }));
        (load, calls)
    }

    #[test]
    fn test_load_runs_once() {
        let (load, calls) = counting_load(false);
        assert_eq!(load.state(), LoadState::Planned);
        assert!(load.load_or_future(None).unwrap());
        assert_eq!(load.state(), LoadState::Loaded);
        // Subsequent calls are no-ops.
        assert!(load.load_or_future(None).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_load_cancels_and_propagates() {
        let (load, _) = counting_load(true);
        let err = load.load_or_future(None).unwrap_err();
        assert!(matches!(err, CacheError::LoadFailed(_)));
        assert_eq!(load.state(), LoadState::Cancelled);
        // Cancelled reads as settled; callers re-probe the cache.
        assert!(load.load_or_future(None).unwrap());
    }

    #[test]
    fn test_drop_wakes_waiters_with_cancelled() {
        struct NeverLoads;
        impl CoalescedLoader for NeverLoads {
            fn load_data(&self, _immediate: bool) -> Result<Vec<CachePin>, CacheError> {
                unreachable!()
            }
        }
        let load = CoalescedLoad::new(Box::new(NeverLoads));
        // Force Loading so a waiter can enlist, then leak the load.
        load.inner.lock().unwrap().state = LoadState::Loading;
        let mut wait = None;
        assert!(!load.load_or_future(Some(&mut wait)).unwrap());
        let future = wait.expect("future for in-flight load");
        drop(load);
        assert!(future.wait());
    }

    #[test]
    fn test_concurrent_loaders_coalesce() {
        let (load, calls) = counting_load(false);
        let load = Arc::new(load);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let load = Arc::clone(&load);
            handles.push(thread::spawn(move || {
                let mut wait = None;
                match load.load_or_future(Some(&mut wait)).unwrap() {
                    true => true,
                    false => wait.map(|f| f.wait()).unwrap_or(false),
                }
            }));
        }
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(load.state(), LoadState::Loaded);
    }

    #[cfg(feature = "shuttle")]
    #[test]
    fn shuttle_concurrent_loaders() {
        crate::utils::shuttle_test(test_concurrent_loaders_coalesce);
    }
}
