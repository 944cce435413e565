//! Named, persistent, doubly-linked lists of records.
//!
//! The header record's payload is `first: Location` followed by the list
//! name; each item's payload is `prior: Location`, `next: Location`, then
//! the data. A mutation touches at most three records (the new item, one
//! neighbour link, the header), so recovery sees either the pre-op or the
//! post-op chain and truncates at the first broken link.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use tracing::warn;

use crate::{
    PersistentStore, StoreError,
    layout::{LOCATION_SIZE, Location, RecordType},
};

const FIRST_AT: u32 = 0; // offset of `first` in the header payload
const PRIOR_AT: u32 = 0; // offset of `prior` in an item payload
const NEXT_AT: u32 = LOCATION_SIZE; // offset of `next` in an item payload
const DATA_AT: usize = 2 * LOCATION_SIZE as usize;

pub(crate) struct ListState {
    name: String,
    header: Location,
    items: VecDeque<Location>,
}

impl ListState {
    pub(crate) fn create(store: &PersistentStore, name: &str) -> Result<Self, StoreError> {
        let mut payload = Vec::with_capacity(LOCATION_SIZE as usize + name.len());
        payload.extend_from_slice(&Location::NULL.to_bytes());
        payload.extend_from_slice(name.as_bytes());
        let header = store.alloc_record(RecordType::ListHeader, &payload)?;
        Ok(Self { name: name.to_string(), header, items: VecDeque::new() })
    }

    /// Walks `first → next → …`, collecting reachable items and truncating
    /// the chain at the first link that leaves the live record set.
    pub(crate) fn load(
        store: &PersistentStore,
        name: String,
        header: Location,
    ) -> Result<Self, StoreError> {
        let (kind, payload) = store.read_typed(header)?;
        if kind != RecordType::ListHeader || payload.len() < LOCATION_SIZE as usize {
            return Err(StoreError::Corrupt(format!("list {name:?} has a bad header record")));
        }

        let mut items = VecDeque::new();
        let mut seen = HashSet::new();
        let mut prev: Option<Location> = None;
        let mut cur = Location::read(&payload[..LOCATION_SIZE as usize]);

        while !cur.is_null() {
            if !seen.insert(cur) {
                warn!(list = %name, "link cycle detected, truncating");
                Self::truncate_after(store, header, prev)?;
                break;
            }
            match store.read_typed(cur) {
                Ok((RecordType::ListItem, item)) if item.len() >= DATA_AT => {
                    items.push_back(cur);
                    prev = Some(cur);
                    cur = Location::read(&item[NEXT_AT as usize..DATA_AT]);
                }
                _ => {
                    warn!(list = %name, ?cur, "broken link, truncating");
                    Self::truncate_after(store, header, prev)?;
                    break;
                }
            }
        }

        Ok(Self { name, header, items })
    }

    fn truncate_after(
        store: &PersistentStore,
        header: Location,
        last_good: Option<Location>,
    ) -> Result<(), StoreError> {
        match last_good {
            Some(item) => store.write_link(item, NEXT_AT, Location::NULL),
            None => store.write_link(header, FIRST_AT, Location::NULL),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn push_back(
        &mut self,
        store: &PersistentStore,
        data: &[u8],
    ) -> Result<Location, StoreError> {
        let prior = self.items.back().copied().unwrap_or(Location::NULL);
        let loc = self.alloc_item(store, prior, Location::NULL, data)?;
        match self.items.back().copied() {
            Some(tail) => store.write_link(tail, NEXT_AT, loc)?,
            None => store.write_link(self.header, FIRST_AT, loc)?,
        }
        self.items.push_back(loc);
        Ok(loc)
    }

    pub(crate) fn push_front(
        &mut self,
        store: &PersistentStore,
        data: &[u8],
    ) -> Result<Location, StoreError> {
        let next = self.items.front().copied().unwrap_or(Location::NULL);
        let loc = self.alloc_item(store, Location::NULL, next, data)?;
        if let Some(first) = self.items.front().copied() {
            store.write_link(first, PRIOR_AT, loc)?;
        }
        store.write_link(self.header, FIRST_AT, loc)?;
        self.items.push_front(loc);
        Ok(loc)
    }

    pub(crate) fn pop_front(
        &mut self,
        store: &PersistentStore,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(first) = self.items.front().copied() else {
            return Ok(None);
        };
        let (_, payload) = store.read_typed(first)?;
        let next = Location::read(&payload[NEXT_AT as usize..DATA_AT]);
        store.write_link(self.header, FIRST_AT, next)?;
        if !next.is_null() {
            store.write_link(next, PRIOR_AT, Location::NULL)?;
        }
        store.free_at(first)?;
        self.items.pop_front();
        Ok(Some(payload[DATA_AT..].to_vec()))
    }

    /// Unlinks and frees one item; returns false when the location is not
    /// part of this list.
    pub(crate) fn erase(
        &mut self,
        store: &PersistentStore,
        loc: Location,
    ) -> Result<bool, StoreError> {
        let Some(idx) = self.items.iter().position(|&l| l == loc) else {
            return Ok(false);
        };
        let (_, payload) = store.read_typed(loc)?;
        let prior = Location::read(&payload[..LOCATION_SIZE as usize]);
        let next = Location::read(&payload[NEXT_AT as usize..DATA_AT]);
        if prior.is_null() {
            store.write_link(self.header, FIRST_AT, next)?;
        } else {
            store.write_link(prior, NEXT_AT, next)?;
        }
        if !next.is_null() {
            store.write_link(next, PRIOR_AT, prior)?;
        }
        store.free_at(loc)?;
        self.items.remove(idx);
        Ok(true)
    }

    /// All entries in insertion order.
    pub(crate) fn entries(
        &self,
        store: &PersistentStore,
    ) -> Result<Vec<(Location, Vec<u8>)>, StoreError> {
        let mut out = Vec::with_capacity(self.items.len());
        for &loc in &self.items {
            let (_, payload) = store.read_typed(loc)?;
            out.push((loc, payload[DATA_AT..].to_vec()));
        }
        Ok(out)
    }

    fn alloc_item(
        &self,
        store: &PersistentStore,
        prior: Location,
        next: Location,
        data: &[u8],
    ) -> Result<Location, StoreError> {
        let mut payload = Vec::with_capacity(DATA_AT + data.len());
        payload.extend_from_slice(&prior.to_bytes());
        payload.extend_from_slice(&next.to_bytes());
        payload.extend_from_slice(data);
        store.alloc_record(RecordType::ListItem, &payload)
    }
}

/// Cheap cloneable handle to a named list. All clones share one state, so
/// a name has at most one in-memory list, enforced by the store registry.
#[derive(Clone)]
pub struct PersistentList {
    store: Arc<PersistentStore>,
    state: Arc<Mutex<ListState>>,
}

impl PersistentList {
    pub(crate) fn new(store: Arc<PersistentStore>, state: Arc<Mutex<ListState>>) -> Self {
        Self { store, state }
    }

    pub fn name(&self) -> String {
        self.state.lock().expect("list lock poisoned").name().to_string()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("list lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push_back(&self, data: &[u8]) -> Result<Location, StoreError> {
        self.state.lock().expect("list lock poisoned").push_back(&self.store, data)
    }

    pub fn push_front(&self, data: &[u8]) -> Result<Location, StoreError> {
        self.state.lock().expect("list lock poisoned").push_front(&self.store, data)
    }

    pub fn pop_front(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.state.lock().expect("list lock poisoned").pop_front(&self.store)
    }

    pub fn erase(&self, loc: Location) -> Result<bool, StoreError> {
        self.state.lock().expect("list lock poisoned").erase(&self.store, loc)
    }

    pub fn entries(&self) -> Result<Vec<(Location, Vec<u8>)>, StoreError> {
        self.state.lock().expect("list lock poisoned").entries(&self.store)
    }

    /// Frees every item, leaving an empty list.
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("list lock poisoned");
        while state.pop_front(&self.store)?.is_some() {}
        Ok(())
    }
}
