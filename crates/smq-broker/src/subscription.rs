//! Destination → subscription mapping.
//!
//! The table is read-heavy and sits behind a reader/writer lock; each
//! subscription guards its own member list and round-robin cursor with its
//! own mutex, so membership churn on one destination never blocks lookups
//! for another.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use indexmap::IndexSet;
use smq_wire::{DestinationKind, QoS};
use tracing::debug;

use crate::connection::ConnId;

pub(crate) struct Subscription {
    destination: String,
    kind: DestinationKind,
    inner: Mutex<SubInner>,
}

struct SubInner {
    /// Members in subscription order.
    members: IndexSet<ConnId>,
    /// Next queue delivery starts from here.
    cursor: usize,
    qos: QoS,
    /// While set, new queue distributions go to retention so a replay of
    /// older messages keeps its order.
    draining: bool,
}

impl Subscription {
    fn new(destination: &str, qos: QoS) -> Self {
        Self {
            destination: destination.to_string(),
            kind: DestinationKind::of(destination),
            inner: Mutex::new(SubInner {
                members: IndexSet::new(),
                cursor: 0,
                qos,
                draining: false,
            }),
        }
    }

    pub(crate) fn destination(&self) -> &str {
        &self.destination
    }

    pub(crate) fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub(crate) fn qos(&self) -> QoS {
        self.inner.lock().expect("subscription poisoned").qos
    }

    /// At-most-once insertion; returns false when already a member.
    pub(crate) fn add(&self, conn: ConnId) -> bool {
        self.inner.lock().expect("subscription poisoned").members.insert(conn)
    }

    /// Removes a member; returns true when it was present.
    pub(crate) fn remove(&self, conn: ConnId) -> bool {
        let mut inner = self.inner.lock().expect("subscription poisoned");
        let Some(idx) = inner.members.shift_remove_full(&conn).map(|(i, _)| i) else {
            return false;
        };
        // keep the cursor on the member that would have been next
        if idx < inner.cursor {
            inner.cursor -= 1;
        }
        if inner.members.is_empty() {
            inner.cursor = 0;
        } else {
            inner.cursor %= inner.members.len();
        }
        true
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().expect("subscription poisoned").members.is_empty()
    }

    pub(crate) fn contains(&self, conn: ConnId) -> bool {
        self.inner.lock().expect("subscription poisoned").members.contains(&conn)
    }

    /// Members in insertion order.
    pub(crate) fn snapshot(&self) -> Vec<ConnId> {
        self.inner.lock().expect("subscription poisoned").members.iter().copied().collect()
    }

    /// Picks the next member round-robin, skipping `exclude`, and advances
    /// the cursor past it.
    pub(crate) fn next_round_robin(&self, exclude: &[ConnId]) -> Option<ConnId> {
        let mut inner = self.inner.lock().expect("subscription poisoned");
        let len = inner.members.len();
        for step in 0..len {
            let idx = (inner.cursor + step) % len;
            let candidate = *inner.members.get_index(idx).expect("index in range");
            if !exclude.contains(&candidate) {
                inner.cursor = (idx + 1) % len;
                return Some(candidate);
            }
        }
        None
    }

    pub(crate) fn set_draining(&self, draining: bool) {
        self.inner.lock().expect("subscription poisoned").draining = draining;
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.inner.lock().expect("subscription poisoned").draining
    }
}

#[derive(Default)]
pub(crate) struct SubscriptionTable {
    map: RwLock<HashMap<String, Arc<Subscription>>>,
}

impl SubscriptionTable {
    /// Joins `conn` to each destination, creating subscriptions lazily.
    /// Returns the subscriptions in filter order paired with whether the
    /// connection is a new member.
    pub(crate) fn subscribe(
        &self,
        conn: ConnId,
        filters: &[(String, QoS)],
    ) -> Vec<(Arc<Subscription>, bool)> {
        let mut out = Vec::with_capacity(filters.len());
        let mut map = self.map.write().expect("subscription table poisoned");
        for (destination, qos) in filters {
            let sub = map
                .entry(destination.clone())
                .or_insert_with(|| {
                    debug!(destination = %destination, "destination created");
                    Arc::new(Subscription::new(destination, *qos))
                })
                .clone();
            let added = sub.add(conn);
            out.push((sub, added));
        }
        out
    }

    /// Removes `conn` from one destination. The subscription is dropped
    /// from the table when its last member leaves, unless `keep` says
    /// retained messages still need it.
    pub(crate) fn unsubscribe(
        &self,
        conn: ConnId,
        destination: &str,
        keep: impl FnOnce(&str) -> bool,
    ) {
        let mut map = self.map.write().expect("subscription table poisoned");
        let Some(sub) = map.get(destination) else {
            return;
        };
        sub.remove(conn);
        if sub.is_empty() && !keep(destination) {
            debug!(destination, "destination destroyed");
            map.remove(destination);
        }
    }

    /// Removes `conn` from every subscription; runs on disconnect and is
    /// idempotent.
    pub(crate) fn remove(&self, conn: ConnId, keep: impl Fn(&str) -> bool) {
        let mut map = self.map.write().expect("subscription table poisoned");
        map.retain(|destination, sub| {
            sub.remove(conn);
            let retain = !sub.is_empty() || keep(destination);
            if !retain {
                debug!(destination = %destination, "destination destroyed");
            }
            retain
        });
    }

    pub(crate) fn resolve(&self, destination: &str) -> Option<Arc<Subscription>> {
        self.map.read().expect("subscription table poisoned").get(destination).cloned()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.read().expect("subscription table poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters(dests: &[&str]) -> Vec<(String, QoS)> {
        dests.iter().map(|d| (d.to_string(), QoS::AtMostOnce)).collect()
    }

    #[test]
    fn subscribe_classifies_and_deduplicates() {
        let table = SubscriptionTable::default();
        let subs = table.subscribe(1, &filters(&["/queue/q", "/topic/t"]));
        assert_eq!(subs[0].0.kind(), DestinationKind::Queue);
        assert_eq!(subs[1].0.kind(), DestinationKind::Topic);
        assert!(subs.iter().all(|(_, added)| *added));

        // at-most-once insertion per (destination, conn)
        let again = table.subscribe(1, &filters(&["/queue/q"]));
        assert!(!again[0].1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn unsubscribe_drops_empty_destinations() {
        let table = SubscriptionTable::default();
        table.subscribe(1, &filters(&["/topic/t"]));
        table.subscribe(2, &filters(&["/topic/t"]));

        table.unsubscribe(1, "/topic/t", |_| false);
        assert_eq!(table.len(), 1);
        table.unsubscribe(2, "/topic/t", |_| false);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn unsubscribe_keeps_destinations_with_retained_messages() {
        let table = SubscriptionTable::default();
        table.subscribe(1, &filters(&["/queue/q"]));
        table.unsubscribe(1, "/queue/q", |_| true);
        assert_eq!(table.len(), 1);
        assert!(table.resolve("/queue/q").unwrap().is_empty());
    }

    #[test]
    fn remove_detaches_a_connection_everywhere() {
        let table = SubscriptionTable::default();
        table.subscribe(7, &filters(&["/topic/a", "/topic/b"]));
        table.subscribe(8, &filters(&["/topic/b"]));

        table.remove(7, |_| false);
        assert!(table.resolve("/topic/a").is_none());
        let b = table.resolve("/topic/b").unwrap();
        assert_eq!(b.snapshot(), vec![8]);

        // idempotent
        table.remove(7, |_| false);
    }

    #[test]
    fn round_robin_cycles_in_insertion_order() {
        let table = SubscriptionTable::default();
        let sub = table.subscribe(1, &filters(&["/queue/q"]))[0].0.clone();
        sub.add(2);
        sub.add(3);

        let picks: Vec<ConnId> = (0..6).map(|_| sub.next_round_robin(&[]).unwrap()).collect();
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn round_robin_skips_excluded_members() {
        let table = SubscriptionTable::default();
        let sub = table.subscribe(1, &filters(&["/queue/q"]))[0].0.clone();
        sub.add(2);
        sub.add(3);

        assert_eq!(sub.next_round_robin(&[1]), Some(2));
        assert_eq!(sub.next_round_robin(&[3]), Some(1));
        assert_eq!(sub.next_round_robin(&[1, 2, 3]), None);
    }

    #[test]
    fn cursor_survives_member_removal() {
        let table = SubscriptionTable::default();
        let sub = table.subscribe(1, &filters(&["/queue/q"]))[0].0.clone();
        sub.add(2);
        sub.add(3);

        assert_eq!(sub.next_round_robin(&[]), Some(1));
        sub.remove(1);
        assert_eq!(sub.next_round_robin(&[]), Some(2));
        assert_eq!(sub.next_round_robin(&[]), Some(3));
        assert_eq!(sub.next_round_robin(&[]), Some(2));
    }
}
