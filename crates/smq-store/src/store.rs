//! The store: a directory of buckets plus the named-list registry.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    Handle, StoreError,
    bucket::Bucket,
    layout::{Location, RecordType, footprint},
    list::{ListState, PersistentList},
};

const BUCKET_EXT: &str = "bucket";
const MANIFEST: &str = "manifest";

/// Companion file recording the configured bucket size; when absent, sizes
/// are inferred from on-disk file lengths.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    bucket_size: u32,
}

/// Crash-recoverable heap of variable-size records with named lists.
///
/// Allocation picks a bucket and locks only that bucket; no two bucket
/// locks are ever held at once, so cross-bucket lists cannot deadlock.
pub struct PersistentStore {
    dir: PathBuf,
    bucket_size: u32,
    buckets: RwLock<BTreeMap<u16, Arc<Bucket>>>,
    lists: Mutex<HashMap<String, Arc<Mutex<ListState>>>>,
}

impl PersistentStore {
    /// Opens (or creates) the store at `<root>/<object>` and runs recovery:
    /// every bucket's free index is rebuilt from record signatures and every
    /// named list is walked and truncated at its first broken link.
    pub fn open(
        root: impl AsRef<Path>,
        object: &str,
        bucket_size: u32,
    ) -> Result<Arc<Self>, StoreError> {
        let dir = root.as_ref().join(object);
        fs::create_dir_all(&dir)?;

        let bucket_size = Self::load_or_write_manifest(&dir, bucket_size)?;

        let mut owned: BTreeMap<u16, Bucket> = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BUCKET_EXT) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u16>().ok())
                .filter(|&id| id > 0)
            else {
                warn!(?path, "ignoring stray file in store directory");
                continue;
            };
            owned.insert(id, Bucket::open(&path, id, bucket_size)?);
        }

        // Rebuild free indices and find every list header.
        let mut list_headers: Vec<(String, Location)> = Vec::new();
        for (&id, bucket) in &mut owned {
            for (offset, header) in bucket.scan() {
                if header.record_type() != Some(RecordType::ListHeader) {
                    continue;
                }
                let (_, payload) = bucket.read(offset)?;
                if payload.len() < crate::layout::LOCATION_SIZE as usize {
                    warn!(bucket = id, offset, "list header too short, ignoring");
                    continue;
                }
                match std::str::from_utf8(&payload[crate::layout::LOCATION_SIZE as usize..]) {
                    Ok(name) => list_headers.push((name.to_string(), Location::new(id, offset))),
                    Err(_) => warn!(bucket = id, offset, "list header name not utf-8, ignoring"),
                }
            }
        }

        let store = Self {
            dir,
            bucket_size,
            buckets: RwLock::new(owned.into_iter().map(|(id, b)| (id, Arc::new(b))).collect()),
            lists: Mutex::new(HashMap::new()),
        };

        for (name, header) in list_headers {
            let mut lists = store.lists.lock().expect("list registry poisoned");
            if lists.contains_key(&name) {
                warn!(list = %name, "duplicate list header, keeping the first");
                continue;
            }
            match ListState::load(&store, name.clone(), header) {
                Ok(state) => {
                    debug!(list = %name, len = state.len(), "recovered list");
                    lists.insert(name, Arc::new(Mutex::new(state)));
                }
                Err(e) => warn!(list = %name, "unrecoverable list dropped: {e}"),
            }
        }

        info!(
            dir = %store.dir.display(),
            buckets = store.buckets.read().expect("bucket registry poisoned").len(),
            "store open"
        );
        Ok(Arc::new(store))
    }

    fn load_or_write_manifest(dir: &Path, bucket_size: u32) -> Result<u32, StoreError> {
        let path = dir.join(MANIFEST);
        if path.exists() {
            let manifest: Manifest = serde_json::from_slice(&fs::read(&path)?)
                .map_err(|e| StoreError::Corrupt(format!("bad manifest: {e}")))?;
            Ok(manifest.bucket_size)
        } else {
            let manifest = Manifest { bucket_size };
            fs::write(&path, serde_json::to_vec(&manifest).expect("manifest serialises"))?;
            Ok(bucket_size)
        }
    }

    /// Allocates a record and returns a handle to it.
    pub fn insert(&self, kind: RecordType, payload: &[u8]) -> Result<Handle, StoreError> {
        self.alloc_record(kind, payload).map(Handle::new)
    }

    /// Frees the record behind `handle`; freeing twice is a no-op.
    pub fn free(&self, handle: Handle) -> Result<(), StoreError> {
        self.free_at(handle.location())
    }

    /// Copies out the payload behind `handle`, validating it is still live.
    pub fn read(&self, handle: Handle) -> Result<Vec<u8>, StoreError> {
        self.read_typed(handle.location()).map(|(_, payload)| payload)
    }

    /// Opens or creates the named list. All callers share one in-memory
    /// list per name.
    pub fn list(self: &Arc<Self>, name: &str) -> Result<PersistentList, StoreError> {
        let mut lists = self.lists.lock().expect("list registry poisoned");
        if let Some(state) = lists.get(name) {
            return Ok(PersistentList::new(self.clone(), state.clone()));
        }
        let state = Arc::new(Mutex::new(ListState::create(self, name)?));
        lists.insert(name.to_string(), state.clone());
        Ok(PersistentList::new(self.clone(), state))
    }

    /// Names of every known list.
    pub fn list_names(&self) -> Vec<String> {
        self.lists.lock().expect("list registry poisoned").keys().cloned().collect()
    }

    pub fn bucket_size(&self) -> u32 {
        self.bucket_size
    }

    /// Free bytes across all buckets.
    pub fn available(&self) -> u64 {
        self.buckets
            .read()
            .expect("bucket registry poisoned")
            .values()
            .map(|b| b.available())
            .sum()
    }

    /// Free extents per bucket, for inspection and tests.
    pub fn free_extents(&self) -> BTreeMap<u16, Vec<(u32, u32)>> {
        self.buckets
            .read()
            .expect("bucket registry poisoned")
            .iter()
            .map(|(&id, b)| (id, b.free_extents()))
            .collect()
    }

    /// Flushes every mapping to disk.
    pub fn flush(&self) {
        for bucket in self.buckets.read().expect("bucket registry poisoned").values() {
            bucket.flush();
        }
    }

    pub(crate) fn alloc_record(
        &self,
        kind: RecordType,
        payload: &[u8],
    ) -> Result<Location, StoreError> {
        let size = u32::try_from(payload.len())
            .map_err(|_| StoreError::TooLarge { size: payload.len(), max: u32::MAX as usize })?;
        if footprint(size) > self.bucket_size {
            return Err(StoreError::TooLarge {
                size: payload.len(),
                max: self.bucket_size as usize,
            });
        }

        {
            let buckets = self.buckets.read().expect("bucket registry poisoned");
            for (&id, bucket) in buckets.iter() {
                if let Some(offset) = bucket.alloc(kind, payload) {
                    return Ok(Location::new(id, offset));
                }
            }
        }

        // Nothing fits: create the next bucket. Re-try under the write lock
        // in case another thread created one first.
        let mut buckets = self.buckets.write().expect("bucket registry poisoned");
        for (&id, bucket) in buckets.iter() {
            if let Some(offset) = bucket.alloc(kind, payload) {
                return Ok(Location::new(id, offset));
            }
        }
        let id = buckets.keys().next_back().map_or(1, |last| {
            last.checked_add(1).expect("bucket ids exhausted")
        });
        let bucket = Bucket::open(&self.bucket_path(id), id, self.bucket_size)?;
        let offset = bucket.alloc(kind, payload).ok_or(StoreError::TooLarge {
            size: payload.len(),
            max: self.bucket_size as usize,
        })?;
        debug!(bucket = id, "created bucket");
        buckets.insert(id, Arc::new(bucket));
        Ok(Location::new(id, offset))
    }

    pub(crate) fn free_at(&self, loc: Location) -> Result<(), StoreError> {
        self.bucket(loc)?.free(loc.offset)
    }

    pub(crate) fn read_typed(&self, loc: Location) -> Result<(RecordType, Vec<u8>), StoreError> {
        self.bucket(loc)?.read(loc.offset)
    }

    /// Overwrites a `Location` link inside a live record's payload.
    pub(crate) fn write_link(
        &self,
        rec: Location,
        at: u32,
        link: Location,
    ) -> Result<(), StoreError> {
        self.bucket(rec)?.write_in_payload(rec.offset, at, &link.to_bytes())
    }

    fn bucket(&self, loc: Location) -> Result<Arc<Bucket>, StoreError> {
        if loc.is_null() {
            return Err(StoreError::StaleHandle(loc));
        }
        self.buckets
            .read()
            .expect("bucket registry poisoned")
            .get(&loc.bucket)
            .cloned()
            .ok_or(StoreError::StaleHandle(loc))
    }

    fn bucket_path(&self, id: u16) -> PathBuf {
        self.dir.join(format!("{id:06}.{BUCKET_EXT}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> Arc<PersistentStore> {
        PersistentStore::open(dir, "broker", 64 * 1024).unwrap()
    }

    #[test]
    fn insert_read_free_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        let anchor = store.insert(RecordType::String, b"anchor").unwrap();
        let before = store.free_extents();

        let handle = store.insert(RecordType::String, b"forty-two").unwrap();
        assert_eq!(store.read(handle).unwrap(), b"forty-two");

        store.free(handle).unwrap();
        assert_eq!(store.free_extents(), before);
        assert!(matches!(store.read(handle), Err(StoreError::StaleHandle(_))));
        // idempotent
        store.free(handle).unwrap();
        assert_eq!(store.read(anchor).unwrap(), b"anchor");
    }

    #[test]
    fn handles_to_the_same_location_alias() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        let a = store.insert(RecordType::String, b"aliased").unwrap();
        let b = Handle::new(a.location());
        assert_eq!(a, b);
        assert_eq!(store.read(a).unwrap(), store.read(b).unwrap());
    }

    #[test]
    fn oversize_record_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        let too_big = vec![0u8; 128 * 1024];
        assert!(matches!(
            store.insert(RecordType::String, &too_big),
            Err(StoreError::TooLarge { .. })
        ));
    }

    #[test]
    fn a_full_bucket_grows_the_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(tmp.path(), "broker", 1024).unwrap();
        let chunk = vec![7u8; 400];
        let mut handles = Vec::new();
        for _ in 0..8 {
            handles.push(store.insert(RecordType::String, &chunk).unwrap());
        }
        let max_bucket = handles.iter().map(|h| h.location().bucket).max().unwrap();
        assert!(max_bucket > 1, "expected spill into further buckets");
        for h in handles {
            assert_eq!(store.read(h).unwrap(), chunk);
        }
    }

    #[test]
    fn lists_share_one_in_memory_state_per_name() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        let a = store.list("/queue/q").unwrap();
        let b = store.list("/queue/q").unwrap();
        a.push_back(b"from a").unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b.pop_front().unwrap().unwrap(), b"from a");
        assert!(a.is_empty());
    }

    #[test]
    fn list_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = open(tmp.path());
            let list = store.list("/queue/jobs").unwrap();
            list.push_back(b"A").unwrap();
            list.push_back(b"B").unwrap();
            list.push_front(b"Z").unwrap();
            store.flush();
        }
        let store = open(tmp.path());
        let list = store.list("/queue/jobs").unwrap();
        let data: Vec<Vec<u8>> = list.entries().unwrap().into_iter().map(|(_, d)| d).collect();
        assert_eq!(data, vec![b"Z".to_vec(), b"A".to_vec(), b"B".to_vec()]);
    }

    #[test]
    fn erase_unlinks_in_the_middle() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        let list = store.list("/queue/q").unwrap();
        list.push_back(b"1").unwrap();
        let (mid, _) = {
            list.push_back(b"2").unwrap();
            list.entries().unwrap()[1].clone()
        };
        list.push_back(b"3").unwrap();

        assert!(list.erase(mid).unwrap());
        assert!(!list.erase(mid).unwrap());
        let data: Vec<Vec<u8>> = list.entries().unwrap().into_iter().map(|(_, d)| d).collect();
        assert_eq!(data, vec![b"1".to_vec(), b"3".to_vec()]);
    }

    #[test]
    fn manifest_pins_the_bucket_size() {
        let tmp = tempfile::tempdir().unwrap();
        {
            PersistentStore::open(tmp.path(), "broker", 8192).unwrap();
        }
        // a different configured size must not override the manifest
        let store = PersistentStore::open(tmp.path(), "broker", 1024 * 1024).unwrap();
        assert_eq!(store.bucket_size(), 8192);
    }
}
