//! Subscription registry with per-row, per-partition and per-table indexes.
//!
//! Matching a change costs three hash lookups (plus one for a moved
//! partition) regardless of how many rows the store holds.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::Query;
use super::models::{Record, RowKey, Table};

pub type SubscriptionId = u64;

pub(crate) type Callback = Box<dyn FnMut(&[Record]) + Send>;

/// Shared handle to a registered callback. `active` is cleared on
/// unsubscribe so that a delivery already pulled from the registry is
/// dropped instead of invoked.
#[derive(Clone)]
pub(crate) struct Listener {
    pub id: SubscriptionId,
    pub query: Query,
    /// Change-log head covered by the initial delivery; changes at or below
    /// it are never delivered again.
    pub since: i64,
    callback: Arc<Mutex<Callback>>,
    active: Arc<AtomicBool>,
}

impl Listener {
    pub fn deliver(&self, rows: &[Record]) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        // A callback that panicked earlier poisons its own mutex; keep
        // delivering rather than silently dropping the subscription.
        let mut callback = match self.callback.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.active.load(Ordering::Acquire) {
            (*callback)(rows);
        }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    next_id: SubscriptionId,
    listeners: HashMap<SubscriptionId, Listener>,
    by_row: HashMap<RowKey, BTreeSet<SubscriptionId>>,
    by_partition: HashMap<(Table, String), BTreeSet<SubscriptionId>>,
    by_table: HashMap<Table, BTreeSet<SubscriptionId>>,
}

impl Registry {
    pub fn insert(&mut self, query: Query, callback: Callback, since: i64) -> Listener {
        self.next_id += 1;
        let id = self.next_id;
        let listener = Listener {
            id,
            query: query.clone(),
            since,
            callback: Arc::new(Mutex::new(callback)),
            active: Arc::new(AtomicBool::new(true)),
        };
        match query {
            Query::Row(key) => {
                self.by_row.entry(key).or_default().insert(id);
            }
            Query::Partition { table, partition } => {
                self.by_partition
                    .entry((table, partition))
                    .or_default()
                    .insert(id);
            }
            Query::Table(table) => {
                self.by_table.entry(table).or_default().insert(id);
            }
        }
        self.listeners.insert(id, listener.clone());
        listener
    }

    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        let Some(listener) = self.listeners.remove(&id) else {
            return false;
        };
        listener.active.store(false, Ordering::Release);
        match listener.query {
            Query::Row(key) => remove_from(&mut self.by_row, &key, id),
            Query::Partition { table, partition } => {
                remove_from(&mut self.by_partition, &(table, partition), id)
            }
            Query::Table(table) => remove_from(&mut self.by_table, &table, id),
        }
        true
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Listeners whose query intersects a change to `key`. Both the old and
    /// the new partition are consulted so a row moving between partitions
    /// notifies both sides.
    pub fn affected(&self, key: &RowKey, partitions: &[Option<&str>]) -> Vec<Listener> {
        let mut ids = BTreeSet::new();
        if let Some(set) = self.by_row.get(key) {
            ids.extend(set.iter().copied());
        }
        if let Some(set) = self.by_table.get(&key.table) {
            ids.extend(set.iter().copied());
        }
        for partition in partitions.iter().flatten() {
            if let Some(set) = self
                .by_partition
                .get(&(key.table, (*partition).to_string()))
            {
                ids.extend(set.iter().copied());
            }
        }
        ids.into_iter()
            .filter_map(|id| self.listeners.get(&id).cloned())
            .collect()
    }
}

fn remove_from<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, BTreeSet<SubscriptionId>>,
    key: &K,
    id: SubscriptionId,
) {
    if let Some(set) = index.get_mut(key) {
        set.remove(&id);
        if set.is_empty() {
            index.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Callback {
        Box::new(|_| {})
    }

    #[test]
    fn test_row_query_matches_only_its_row() {
        let mut reg = Registry::default();
        let l = reg.insert(Query::Row(RowKey::phase(1)), noop(), 0);
        assert_eq!(reg.affected(&RowKey::phase(1), &[None]).len(), 1);
        assert!(reg.affected(&RowKey::phase(2), &[None]).is_empty());
        assert!(reg.remove(l.id));
        assert!(reg.affected(&RowKey::phase(1), &[None]).is_empty());
    }

    #[test]
    fn test_partition_query_matches_old_and_new_partition() {
        let mut reg = Registry::default();
        reg.insert(Query::partition(Table::Tasks, "0:0"), noop(), 0);
        let key = RowKey::task("t-1");
        assert_eq!(reg.affected(&key, &[Some("1:0"), Some("0:0")]).len(), 1);
        assert!(reg.affected(&key, &[Some("1:0"), Some("1:0")]).is_empty());
    }

    #[test]
    fn test_overlapping_queries_deliver_once_each() {
        let mut reg = Registry::default();
        reg.insert(Query::Table(Table::Steps), noop(), 0);
        reg.insert(Query::Row(RowKey::step(0, 0)), noop(), 0);
        reg.insert(Query::partition(Table::Steps, "0"), noop(), 0);
        let hits = reg.affected(&RowKey::step(0, 0), &[Some("0"), Some("0")]);
        assert_eq!(hits.len(), 3);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_removed_listener_ignores_pending_delivery() {
        let mut reg = Registry::default();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        let l = reg.insert(
            Query::Table(Table::Phases),
            Box::new(move |_| *counter.lock().unwrap() += 1),
            0,
        );
        l.deliver(&[]);
        reg.remove(l.id);
        l.deliver(&[]);
        assert_eq!(*hits.lock().unwrap(), 1);
        assert!(!reg.remove(l.id));
    }
}
