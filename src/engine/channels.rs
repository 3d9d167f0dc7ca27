//! Per-channel resource table
//!
//! Each entry carries a generation number. Workers that outlive their
//! entry (because it was stopped and replaced) can only remove the
//! entry they were started with.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::ChannelId;

struct Slot<T> {
    generation: u64,
    value: T,
}

/// Concurrent map from channel id to that channel's live resources
pub struct ChannelTable<T> {
    slots: DashMap<ChannelId, Slot<T>>,
    generations: AtomicU64,
}

impl<T> ChannelTable<T> {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            generations: AtomicU64::new(1),
        }
    }

    /// A generation number never handed out before
    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    /// Install `value` for `channel`, returning whatever it displaced
    pub fn replace(&self, channel: ChannelId, generation: u64, value: T) -> Option<T> {
        self.slots
            .insert(channel, Slot { generation, value })
            .map(|old| old.value)
    }

    /// Remove the channel's entry, whatever its generation
    pub fn take(&self, channel: ChannelId) -> Option<T> {
        self.slots.remove(&channel).map(|(_, slot)| slot.value)
    }

    /// Remove the channel's entry only if it is still `generation`
    pub fn take_if_current(&self, channel: ChannelId, generation: u64) -> Option<T> {
        self.slots
            .remove_if(&channel, |_, slot| slot.generation == generation)
            .map(|(_, slot)| slot.value)
    }

    /// Read the channel's entry under its shard lock
    pub fn with<R>(&self, channel: ChannelId, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.slots.get(&channel).map(|slot| f(&slot.value))
    }

    pub fn contains(&self, channel: ChannelId) -> bool {
        self.slots.contains_key(&channel)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.slots.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Remove every entry
    pub fn drain(&self) -> Vec<(ChannelId, T)> {
        self.channels()
            .into_iter()
            .filter_map(|id| self.take(id).map(|v| (id, v)))
            .collect()
    }
}

impl<T> Default for ChannelTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_returns_displaced() {
        let table = ChannelTable::new();
        let g1 = table.next_generation();
        assert!(table.replace(3, g1, "a").is_none());
        let g2 = table.next_generation();
        assert_eq!(table.replace(3, g2, "b"), Some("a"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_stale_generation_cannot_remove() {
        let table = ChannelTable::new();
        let old = table.next_generation();
        table.replace(1, old, 10);
        let new = table.next_generation();
        table.replace(1, new, 20);

        assert_eq!(table.take_if_current(1, old), None);
        assert_eq!(table.with(1, |v| *v), Some(20));
        assert_eq!(table.take_if_current(1, new), Some(20));
        assert!(table.is_empty());
    }

    #[test]
    fn test_drain() {
        let table = ChannelTable::new();
        for id in [5, 1, 3] {
            let g = table.next_generation();
            table.replace(id, g, id * 2);
        }
        assert_eq!(table.channels(), vec![1, 3, 5]);
        assert_eq!(table.with(3, |v| *v), Some(6));
        assert_eq!(table.drain(), vec![(1, 2), (3, 6), (5, 10)]);
        assert!(!table.contains(1));
    }
}
