//! Priority queue of static roles keyed by next rotation time.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
};

use super::StaticRoleConfig;

/// A queued rotation: `priority` is the unix time at which `key` is due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationItem {
    pub key: String,
    pub priority: i64,
    pub value: StaticRoleConfig,
}

/// Min-heap over rotation time with at most one item per key.
///
/// Replaced and removed items stay in the heap and are skipped when popped;
/// `generations` records which heap entry is current for each key.
#[derive(Debug, Default)]
pub struct RotationQueue {
    heap: BinaryHeap<Reverse<(i64, String, u64)>>,
    items: HashMap<String, (u64, RotationItem)>,
    next_generation: u64,
}

impl RotationQueue {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Inserts `item`, replacing any item with the same key.
    pub fn push(&mut self, item: RotationItem) {
        let generation = self.next_generation;
        self.next_generation += 1;

        self.heap
            .push(Reverse((item.priority, item.key.clone(), generation)));
        self.items.insert(item.key.clone(), (generation, item));
    }

    /// Removes and returns the item with the lowest priority.
    pub fn pop(&mut self) -> Option<RotationItem> {
        while let Some(Reverse((_, key, generation))) = self.heap.pop() {
            match self.items.get(&key) {
                Some((current, _)) if *current == generation => {
                    return self.items.remove(&key).map(|(_, item)| item);
                }
                _ => continue,
            }
        }
        None
    }

    /// Replaces the stored role of a queued item without moving it.
    /// Returns `false` when `key` is not queued.
    pub fn update_value(&mut self, key: &str, value: StaticRoleConfig) -> bool {
        match self.items.get_mut(key) {
            Some((_, item)) => {
                item.value = value;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<RotationItem> {
        self.items.remove(key).map(|(_, item)| item)
    }

    /// All queued items in the order `pop` would return them.
    pub fn snapshot(&self) -> Vec<RotationItem> {
        let mut items = self
            .items
            .values()
            .map(|(_, item)| item.clone())
            .collect::<Vec<_>>();
        items.sort_by(|a, b| (a.priority, &a.key).cmp(&(b.priority, &b.key)));
        items
    }
}
