//! Retention for queue messages published with no live subscriber.
//!
//! With a store configured, each queue destination keeps a
//! [`PersistentList`] whose entries are SMQ-framed messages; entries stay in
//! the list until the delivery is acknowledged, so a crash replays anything
//! still unsettled. Without a store, retention falls back to an in-memory
//! deque with the same contract, and a destination whose list goes bad at
//! runtime is downgraded to that volatile form.

use std::{
    collections::VecDeque,
    sync::Mutex,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::BytesMut;
use smq_store::{Location, PersistentList, StoreError};
use smq_wire::{Framer, Message, SmqFramer};

/// A settled-on-ack reference to one retained entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetainedRef {
    Durable(Location),
    Volatile(u64),
}

struct VolatileEntry {
    seq: u64,
    bytes: Vec<u8>,
    in_flight: bool,
}

pub(crate) enum RetainedQueue {
    Durable { list: PersistentList, in_flight: Mutex<Vec<Location>> },
    Volatile { entries: Mutex<VecDeque<VolatileEntry>>, next_seq: AtomicU64 },
}

impl RetainedQueue {
    pub(crate) fn durable(list: PersistentList) -> Self {
        Self::Durable { list, in_flight: Mutex::new(Vec::new()) }
    }

    pub(crate) fn volatile() -> Self {
        Self::Volatile { entries: Mutex::new(VecDeque::new()), next_seq: AtomicU64::new(0) }
    }

    pub(crate) fn is_durable(&self) -> bool {
        matches!(self, Self::Durable { .. })
    }

    /// Appends a message, oldest first.
    pub(crate) fn push(&self, codec: &SmqFramer, msg: &Message) -> Result<(), StoreError> {
        let mut bytes = Vec::new();
        codec.encode(&mut bytes, msg).map_err(|e| {
            StoreError::Corrupt(format!("unencodable message for retention: {e}"))
        })?;
        match self {
            Self::Durable { list, .. } => {
                list.push_back(&bytes)?;
            }
            Self::Volatile { entries, next_seq } => {
                let seq = next_seq.fetch_add(1, Ordering::Relaxed);
                entries
                    .lock()
                    .expect("retained entries poisoned")
                    .push_back(VolatileEntry { seq, bytes, in_flight: false });
            }
        }
        Ok(())
    }

    /// Takes every entry not already out for delivery, marking each
    /// in-flight. Entries keep their list position until settled.
    pub(crate) fn take_batch(
        &self,
        codec: &SmqFramer,
    ) -> Result<Vec<(RetainedRef, Message)>, StoreError> {
        match self {
            Self::Durable { list, in_flight } => {
                let mut in_flight = in_flight.lock().expect("in-flight set poisoned");
                let mut out = Vec::new();
                for (loc, bytes) in list.entries()? {
                    if in_flight.contains(&loc) {
                        continue;
                    }
                    let msg = decode_retained(codec, &bytes)?;
                    in_flight.push(loc);
                    out.push((RetainedRef::Durable(loc), msg));
                }
                Ok(out)
            }
            Self::Volatile { entries, .. } => {
                let mut entries = entries.lock().expect("retained entries poisoned");
                let mut out = Vec::new();
                for entry in entries.iter_mut().filter(|e| !e.in_flight) {
                    let msg = decode_retained(codec, &entry.bytes)?;
                    entry.in_flight = true;
                    out.push((RetainedRef::Volatile(entry.seq), msg));
                }
                Ok(out)
            }
        }
    }

    /// The delivery was acknowledged (or needed no ack): drop the entry.
    pub(crate) fn settle(&self, r: RetainedRef) -> Result<(), StoreError> {
        match (self, r) {
            (Self::Durable { list, in_flight }, RetainedRef::Durable(loc)) => {
                in_flight.lock().expect("in-flight set poisoned").retain(|l| *l != loc);
                list.erase(loc)?;
                Ok(())
            }
            (Self::Volatile { entries, .. }, RetainedRef::Volatile(seq)) => {
                entries.lock().expect("retained entries poisoned").retain(|e| e.seq != seq);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// The delivery failed or its ack window lapsed: put the entry back in
    /// contention at its original position.
    pub(crate) fn release(&self, r: RetainedRef) {
        match (self, r) {
            (Self::Durable { in_flight, .. }, RetainedRef::Durable(loc)) => {
                in_flight.lock().expect("in-flight set poisoned").retain(|l| *l != loc);
            }
            (Self::Volatile { entries, .. }, RetainedRef::Volatile(seq)) => {
                if let Some(entry) = entries
                    .lock()
                    .expect("retained entries poisoned")
                    .iter_mut()
                    .find(|e| e.seq == seq)
                {
                    entry.in_flight = false;
                }
            }
            _ => {}
        }
    }

    /// Entries neither delivered nor in flight.
    pub(crate) fn pending(&self) -> usize {
        match self {
            Self::Durable { list, in_flight } => {
                let inflight = in_flight.lock().expect("in-flight set poisoned").len();
                list.len().saturating_sub(inflight)
            }
            Self::Volatile { entries, .. } => entries
                .lock()
                .expect("retained entries poisoned")
                .iter()
                .filter(|e| !e.in_flight)
                .count(),
        }
    }

    /// Total entries, in flight or not.
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Durable { list, .. } => list.len(),
            Self::Volatile { entries, .. } => {
                entries.lock().expect("retained entries poisoned").len()
            }
        }
    }
}

fn decode_retained(codec: &SmqFramer, bytes: &[u8]) -> Result<Message, StoreError> {
    let mut buf = BytesMut::from(bytes);
    codec
        .decode(&mut buf)
        .ok()
        .flatten()
        .ok_or_else(|| StoreError::Corrupt("undecodable retained message".into()))
}
