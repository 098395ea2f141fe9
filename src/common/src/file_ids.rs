//! Interned, reference-counted file identifiers.
//!
//! Cache keys refer to files by a dense integer id instead of a path. The
//! [`StringIdMap`] hands out ids and keeps a string alive for as long as any
//! [`StringIdLease`] for it exists, so an id can never be recycled while a
//! cache entry still points at it.

use std::sync::{Arc, Mutex, OnceLock};

use ahash::HashMap;

/// Id value that is never handed out. Cache entries use it to mean
/// "no longer addressable".
pub const NO_FILE_ID: u64 = 0;

struct IdEntry {
    string: String,
    ref_count: u64,
}

#[derive(Default)]
struct StringIdMapInner {
    ids: HashMap<String, u64>,
    strings: HashMap<u64, IdEntry>,
    last_id: u64,
    pinned_bytes: usize,
}

/// Bidirectional map between strings and dense ids with per-id reference
/// counts. An id stays valid until the last lease for it is dropped.
#[derive(Default)]
pub struct StringIdMap {
    inner: Mutex<StringIdMapInner>,
}

impl std::fmt::Debug for StringIdMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("StringIdMap")
            .field("num_ids", &inner.strings.len())
            .field("pinned_bytes", &inner.pinned_bytes)
            .finish()
    }
}

impl StringIdMap {
    /// Create an empty map. Ids start at 1; [`NO_FILE_ID`] is never produced.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `string`, returning a lease that pins its id.
    pub fn lease(self: &Arc<Self>, string: &str) -> StringIdLease {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&id) = inner.ids.get(string) {
            inner
                .strings
                .get_mut(&id)
                .expect("id table out of sync")
                .ref_count += 1;
            return StringIdLease {
                map: Arc::clone(self),
                id,
            };
        }
        inner.last_id += 1;
        let id = inner.last_id;
        inner.ids.insert(string.to_owned(), id);
        inner.strings.insert(
            id,
            IdEntry {
                string: string.to_owned(),
                ref_count: 1,
            },
        );
        inner.pinned_bytes += string.len();
        StringIdLease {
            map: Arc::clone(self),
            id,
        }
    }

    /// Take an additional lease on an already-interned id. Returns `None` if
    /// the id is not live.
    pub fn lease_by_id(self: &Arc<Self>, id: u64) -> Option<StringIdLease> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.strings.get_mut(&id)?;
        entry.ref_count += 1;
        Some(StringIdLease {
            map: Arc::clone(self),
            id,
        })
    }

    /// The string for `id`, if the id is live.
    pub fn string_of(&self, id: u64) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.strings.get(&id).map(|e| e.string.clone())
    }

    /// Total bytes of strings currently pinned by leases.
    pub fn pinned_bytes(&self) -> usize {
        self.inner.lock().unwrap().pinned_bytes
    }

    fn add_reference(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .strings
            .get_mut(&id)
            .expect("add_reference on dead file id")
            .ref_count += 1;
    }

    fn release(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.strings.get_mut(&id).expect("release on dead file id");
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            let entry = inner.strings.remove(&id).unwrap();
            inner.ids.remove(&entry.string);
            inner.pinned_bytes -= entry.string.len();
        }
    }
}

/// RAII reference to an interned id. Cloning takes another reference,
/// dropping releases one; the id outlives all cache entries that hold it.
pub struct StringIdLease {
    map: Arc<StringIdMap>,
    id: u64,
}

impl StringIdLease {
    /// The interned id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Clone for StringIdLease {
    fn clone(&self) -> Self {
        self.map.add_reference(self.id);
        Self {
            map: Arc::clone(&self.map),
            id: self.id,
        }
    }
}

impl Drop for StringIdLease {
    fn drop(&mut self) {
        self.map.release(self.id);
    }
}

impl std::fmt::Debug for StringIdLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StringIdLease({})", self.id)
    }
}

/// The process-wide table of file ids. Consumers that need isolation pass
/// their own [`StringIdMap`] to the cache builder instead.
pub fn file_ids() -> &'static Arc<StringIdMap> {
    static FILE_IDS: OnceLock<Arc<StringIdMap>> = OnceLock::new();
    FILE_IDS.get_or_init(|| Arc::new(StringIdMap::new()))
}
