//! A bucket: one fixed-size memory-mapped file holding an arena of records.
//!
//! Arena invariants:
//! - every byte belongs to exactly one live record, freed extent, or the
//!   never-written tail;
//! - a freed record's `size` field counts the exact bytes following its
//!   header, so a scan can step over it without rounding;
//! - an unrecognisable header terminates the written prefix — everything
//!   from there to capacity is free.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::OpenOptions,
    path::Path,
    sync::Mutex,
};

use memmap2::MmapMut;
use tracing::warn;

use crate::{
    StoreError,
    layout::{ALLOCATED, FREED, RECORD_HEADER_SIZE, RecordHeader, RecordType, footprint},
};

pub const DEFAULT_BUCKET_SIZE: u32 = 64 * 1024 * 1024;

/// Free extents of one bucket, ordered by offset for coalescing and by size
/// for best-fit allocation.
#[derive(Debug, Default)]
pub(crate) struct FreeIndex {
    by_offset: BTreeMap<u32, u32>,
    by_size: BTreeSet<(u32, u32)>,
    total: u64,
}

impl FreeIndex {
    fn remove(&mut self, offset: u32, len: u32) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(len, offset));
        self.total -= u64::from(len);
    }

    fn add(&mut self, offset: u32, len: u32) {
        self.by_offset.insert(offset, len);
        self.by_size.insert((len, offset));
        self.total += u64::from(len);
    }

    /// Records a freed extent, merging with adjacent free neighbours.
    pub(crate) fn insert(&mut self, mut offset: u32, mut len: u32) {
        if len == 0 {
            return;
        }
        if let Some((&prev_off, &prev_len)) = self.by_offset.range(..offset).next_back() {
            if prev_off + prev_len == offset {
                self.remove(prev_off, prev_len);
                offset = prev_off;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.by_offset.get(&(offset + len)) {
            self.remove(offset + len, next_len);
            len += next_len;
        }
        self.add(offset, len);
    }

    /// Best-fit: the smallest extent that fits `need` exactly or leaves
    /// room for a tombstone header behind the allocation.
    fn take(&mut self, need: u32) -> Option<(u32, u32)> {
        let (len, offset) = self
            .by_size
            .range((need, 0)..)
            .find(|(len, _)| *len == need || *len >= need + RECORD_HEADER_SIZE)
            .copied()?;
        self.remove(offset, len);
        let remainder = len - need;
        if remainder > 0 {
            // The taken front leaves a maximal extent; no neighbour merge.
            self.add(offset + need, remainder);
        }
        Some((offset, remainder))
    }

    pub(crate) fn available(&self) -> u64 {
        self.total
    }

    pub(crate) fn extents(&self) -> Vec<(u32, u32)> {
        self.by_offset.iter().map(|(&o, &l)| (o, l)).collect()
    }
}

struct BucketInner {
    map: MmapMut,
    free: FreeIndex,
}

pub(crate) struct Bucket {
    id: u16,
    capacity: u32,
    inner: Mutex<BucketInner>,
}

impl Bucket {
    /// Creates the bucket file with a fixed capacity, or opens an existing
    /// one whose capacity is its on-disk length.
    pub(crate) fn open(path: &Path, id: u16, capacity: u32) -> Result<Self, StoreError> {
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
        let len = file.metadata()?.len();
        let capacity = if len == 0 {
            file.set_len(u64::from(capacity))?;
            capacity
        } else {
            u32::try_from(len).map_err(|_| {
                StoreError::Corrupt(format!("bucket file {} larger than 4 GiB", path.display()))
            })?
        };
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut bucket =
            Self { id, capacity, inner: Mutex::new(BucketInner { map, free: FreeIndex::default() }) };
        bucket.scan();
        Ok(bucket)
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Rebuilds the free index from record signatures and returns the live
    /// records in arena order.
    pub(crate) fn scan(&mut self) -> Vec<(u32, RecordHeader)> {
        let inner = self.inner.get_mut().expect("bucket lock poisoned");
        Self::scan_inner(self.capacity, inner)
    }

    fn scan_inner(capacity: u32, inner: &mut BucketInner) -> Vec<(u32, RecordHeader)> {
        inner.free = FreeIndex::default();
        let mut live = Vec::new();
        let mut off: u32 = 0;
        let mut run_start: Option<u32> = None;

        while off + RECORD_HEADER_SIZE <= capacity {
            let header = RecordHeader::read(&inner.map[off as usize..]);
            if header.signature == ALLOCATED && header.record_type().is_some() {
                let foot = footprint(header.size);
                let Some(end) = off.checked_add(foot).filter(|&e| e <= capacity) else {
                    // Torn record; the written prefix ends here.
                    break;
                };
                if let Some(start) = run_start.take() {
                    inner.free.insert(start, off - start);
                }
                live.push((off, header));
                off = end;
            } else if header.signature == FREED {
                let Some(end) = off
                    .checked_add(RECORD_HEADER_SIZE)
                    .and_then(|e| e.checked_add(header.size))
                    .filter(|&e| e <= capacity)
                else {
                    break;
                };
                run_start.get_or_insert(off);
                off = end;
            } else {
                // Unwritten tail.
                break;
            }
        }

        let tail = run_start.unwrap_or(off);
        if tail < capacity {
            inner.free.insert(tail, capacity - tail);
        }
        live
    }

    /// Allocates a record, writing the header before the payload. Returns
    /// the record offset, or `None` when no extent fits.
    pub(crate) fn alloc(&self, kind: RecordType, payload: &[u8]) -> Option<u32> {
        let size = u32::try_from(payload.len()).ok()?;
        let foot = footprint(size);
        let mut inner = self.inner.lock().expect("bucket lock poisoned");
        let (offset, remainder) = inner.free.take(foot)?;

        // Tombstone the remainder first so a crash between these writes
        // leaves the scan chain intact up to the torn record.
        if remainder > 0 {
            let tombstone =
                RecordHeader { signature: FREED, kind: 0, size: remainder - RECORD_HEADER_SIZE };
            tombstone.write(&mut inner.map[(offset + foot) as usize..]);
        }

        let header = RecordHeader { signature: ALLOCATED, kind: kind as u8, size };
        header.write(&mut inner.map[offset as usize..]);
        let data_at = (offset + RECORD_HEADER_SIZE) as usize;
        inner.map[data_at..data_at + payload.len()].copy_from_slice(payload);
        Some(offset)
    }

    /// Marks the record freed and coalesces the extent with its free
    /// neighbours. Freeing an already-freed record is a no-op.
    pub(crate) fn free(&self, offset: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("bucket lock poisoned");
        let header = self.header_at(&inner, offset)?;
        if header.signature == FREED {
            return Ok(());
        }
        if header.signature != ALLOCATED {
            return Err(StoreError::StaleHandle(crate::Location::new(self.id, offset)));
        }
        let foot = footprint(header.size);
        if offset + foot > self.capacity {
            return Err(StoreError::Corrupt(format!(
                "record at {offset} overruns bucket {}",
                self.id
            )));
        }
        let freed = RecordHeader { signature: FREED, kind: 0, size: foot - RECORD_HEADER_SIZE };
        freed.write(&mut inner.map[offset as usize..]);
        inner.free.insert(offset, foot);
        Ok(())
    }

    /// Copies out the payload of a live record.
    pub(crate) fn read(&self, offset: u32) -> Result<(RecordType, Vec<u8>), StoreError> {
        let inner = self.inner.lock().expect("bucket lock poisoned");
        let header = self.live_header(&inner, offset)?;
        let kind = header.record_type().ok_or_else(|| {
            StoreError::Corrupt(format!("record at {offset} in bucket {} has bad type", self.id))
        })?;
        let data_at = (offset + RECORD_HEADER_SIZE) as usize;
        Ok((kind, inner.map[data_at..data_at + header.size as usize].to_vec()))
    }

    /// Overwrites `bytes` at `at` within a live record's payload.
    pub(crate) fn write_in_payload(
        &self,
        offset: u32,
        at: u32,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("bucket lock poisoned");
        let header = self.live_header(&inner, offset)?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| StoreError::TooLarge { size: bytes.len(), max: u32::MAX as usize })?;
        if at.checked_add(len).is_none_or(|end| end > header.size) {
            return Err(StoreError::Corrupt(format!(
                "write past record payload in bucket {}",
                self.id
            )));
        }
        let data_at = (offset + RECORD_HEADER_SIZE + at) as usize;
        inner.map[data_at..data_at + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn available(&self) -> u64 {
        self.inner.lock().expect("bucket lock poisoned").free.available()
    }

    pub(crate) fn free_extents(&self) -> Vec<(u32, u32)> {
        self.inner.lock().expect("bucket lock poisoned").free.extents()
    }

    pub(crate) fn flush(&self) {
        let inner = self.inner.lock().expect("bucket lock poisoned");
        if let Err(e) = inner.map.flush() {
            warn!(bucket = self.id, "bucket flush failed: {e}");
        }
    }

    fn header_at(&self, inner: &BucketInner, offset: u32) -> Result<RecordHeader, StoreError> {
        if offset + RECORD_HEADER_SIZE > self.capacity {
            return Err(StoreError::StaleHandle(crate::Location::new(self.id, offset)));
        }
        Ok(RecordHeader::read(&inner.map[offset as usize..]))
    }

    /// Header of a record that must be live, with its payload in bounds.
    fn live_header(&self, inner: &BucketInner, offset: u32) -> Result<RecordHeader, StoreError> {
        let header = self.header_at(inner, offset)?;
        if header.signature != ALLOCATED {
            return Err(StoreError::StaleHandle(crate::Location::new(self.id, offset)));
        }
        if offset + footprint(header.size) > self.capacity {
            return Err(StoreError::Corrupt(format!(
                "record at {offset} overruns bucket {}",
                self.id
            )));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(capacity: u32) -> (tempfile::TempDir, Bucket) {
        let dir = tempfile::tempdir().unwrap();
        let bucket = Bucket::open(&dir.path().join("000001.bucket"), 1, capacity).unwrap();
        (dir, bucket)
    }

    #[test]
    fn fresh_bucket_is_one_free_extent() {
        let (_dir, b) = bucket(4096);
        assert_eq!(b.free_extents(), vec![(0, 4096)]);
        assert_eq!(b.available(), 4096);
    }

    #[test]
    fn alloc_then_free_restores_the_free_set() {
        let (_dir, b) = bucket(4096);
        let before = b.free_extents();
        let off = b.alloc(RecordType::String, b"hello world").unwrap();
        assert_ne!(b.free_extents(), before);
        b.free(off).unwrap();
        assert_eq!(b.free_extents(), before);
    }

    #[test]
    fn free_is_idempotent() {
        let (_dir, b) = bucket(4096);
        let off = b.alloc(RecordType::String, b"x").unwrap();
        b.free(off).unwrap();
        let extents = b.free_extents();
        b.free(off).unwrap();
        assert_eq!(b.free_extents(), extents);
    }

    #[test]
    fn adjacent_frees_coalesce() {
        let (_dir, b) = bucket(4096);
        let a = b.alloc(RecordType::String, &[1u8; 32]).unwrap();
        let c = b.alloc(RecordType::String, &[2u8; 32]).unwrap();
        let e = b.alloc(RecordType::String, &[3u8; 32]).unwrap();
        b.free(a).unwrap();
        b.free(e).unwrap();
        b.free(c).unwrap();
        // one merged extent spanning the whole bucket again
        assert_eq!(b.free_extents(), vec![(0, 4096)]);
    }

    #[test]
    fn read_after_free_is_stale() {
        let (_dir, b) = bucket(4096);
        let off = b.alloc(RecordType::String, b"payload").unwrap();
        assert_eq!(b.read(off).unwrap().1, b"payload");
        b.free(off).unwrap();
        assert!(matches!(b.read(off), Err(StoreError::StaleHandle(_))));
    }

    #[test]
    fn alloc_skips_extents_that_cannot_hold_a_tombstone() {
        let mut idx = FreeIndex::default();
        idx.insert(0, 20);
        // need 15 would leave a 5-byte remainder: no room for a header
        assert_eq!(idx.take(15), None);
        assert_eq!(idx.take(20), Some((0, 0)));
    }

    #[test]
    fn scan_rebuilds_live_records_and_free_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001.bucket");
        let (a, c) = {
            let b = Bucket::open(&path, 1, 4096).unwrap();
            let a = b.alloc(RecordType::String, b"aaaa").unwrap();
            let x = b.alloc(RecordType::String, b"xxxx").unwrap();
            let c = b.alloc(RecordType::String, b"cccc").unwrap();
            b.free(x).unwrap();
            b.flush();
            (a, c)
        };

        let mut reopened = Bucket::open(&path, 1, 4096).unwrap();
        let live = reopened.scan();
        let offsets: Vec<u32> = live.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![a, c]);
        assert_eq!(reopened.read(a).unwrap().1, b"aaaa");
        assert_eq!(reopened.read(c).unwrap().1, b"cccc");
        // freed middle record merged into the index
        let total: u64 = reopened.free_extents().iter().map(|(_, l)| u64::from(*l)).sum();
        assert_eq!(total, reopened.available());
    }

    #[test]
    fn full_bucket_rejects_allocation() {
        let (_dir, b) = bucket(64);
        assert!(b.alloc(RecordType::String, &[0u8; 128]).is_none());
    }
}
