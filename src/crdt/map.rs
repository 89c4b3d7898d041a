//! A map from opaque keys to nested replicated values.

use std::collections::{HashMap, HashSet};

use prost_types::Any;
use tracing::{debug, warn};

use crate::any_support::{comparable_key, AnySupport, ComparableKey};
use crate::crdt::{CrdtError, ReplicatedData};
use crate::proto::{ReplicatedMapDelta, ReplicatedMapEntryDelta};

#[derive(Debug, Clone)]
struct MapEntry {
    key: Any,
    value: ReplicatedData,
}

/// Replicated map. Values are themselves replicated data types; the delta
/// nests each value's own delta. Keys are compared by canonical key.
#[derive(Debug, Clone, Default)]
pub struct ReplicatedMap {
    entries: HashMap<ComparableKey, MapEntry>,
    added: HashSet<ComparableKey>,
    removed: HashMap<ComparableKey, Any>,
    cleared: bool,
}

impl ReplicatedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Any) -> Option<&ReplicatedData> {
        self.entries.get(&comparable_key(key)).map(|e| &e.value)
    }

    pub fn get_mut(&mut self, key: &Any) -> Option<&mut ReplicatedData> {
        self.entries
            .get_mut(&comparable_key(key))
            .map(|e| &mut e.value)
    }

    /// Get the value for a key, inserting one from the default callback
    /// when absent. A default of None inserts nothing.
    ///
    /// An entry inserted this way is a tracked addition, exactly as if it
    /// had been [`set`](Self::set).
    pub fn get_or_create(
        &mut self,
        key: &Any,
        default: impl FnOnce() -> Option<ReplicatedData>,
    ) -> Option<&mut ReplicatedData> {
        let ck = comparable_key(key);
        if !self.entries.contains_key(&ck) {
            let value = default()?;
            self.set(key.clone(), value);
        }
        self.entries.get_mut(&ck).map(|e| &mut e.value)
    }

    pub fn has(&self, key: &Any) -> bool {
        self.entries.contains_key(&comparable_key(key))
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Any> {
        self.entries.values().map(|e| &e.key)
    }

    pub fn values(&self) -> impl Iterator<Item = &ReplicatedData> {
        self.entries.values().map(|e| &e.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Any, &ReplicatedData)> {
        self.entries.values().map(|e| (&e.key, &e.value))
    }

    pub fn for_each(&self, mut f: impl FnMut(&Any, &ReplicatedData)) {
        for entry in self.entries.values() {
            f(&entry.key, &entry.value);
        }
    }

    /// Insert or replace the value for a key.
    ///
    /// Replacing an existing, already-flushed entry is a remove-then-add:
    /// the same flushed delta carries both operations. Re-adding a key
    /// deleted in the current flush window likewise keeps the removal on
    /// record alongside the addition.
    pub fn set(&mut self, key: Any, value: ReplicatedData) {
        let ck = comparable_key(&key);
        if let Some(existing) = self.entries.get_mut(&ck) {
            if self.added.contains(&ck) {
                existing.value = value;
            } else {
                warn!(
                    type_url = %key.type_url,
                    "Replacing map value for an existing key; the delta carries a remove and an add"
                );
                self.removed.insert(ck.clone(), existing.key.clone());
                self.added.insert(ck);
                existing.value = value;
            }
            return;
        }

        if self.removed.contains_key(&ck) {
            warn!(
                type_url = %key.type_url,
                "Re-adding map key deleted in the same flush window; the delta carries both"
            );
        }
        self.added.insert(ck.clone());
        self.entries.insert(ck, MapEntry { key, value });
    }

    /// Remove a key. Returns false when it was not present.
    pub fn delete(&mut self, key: &Any) -> bool {
        let ck = comparable_key(key);
        match self.entries.remove(&ck) {
            None => false,
            Some(entry) => {
                if !self.added.remove(&ck) {
                    self.removed.insert(ck, entry.key);
                }
                true
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.added.clear();
        self.removed.clear();
        self.cleared = true;
    }

    pub fn get_and_reset_delta(&mut self, initial: bool) -> Option<ReplicatedMapDelta> {
        if initial {
            let added = self
                .entries
                .values_mut()
                .map(|entry| ReplicatedMapEntryDelta {
                    key: Some(entry.key.clone()),
                    delta: entry.value.get_and_reset_delta(true),
                })
                .collect();
            self.added.clear();
            self.removed.clear();
            self.cleared = false;
            return Some(ReplicatedMapDelta {
                cleared: false,
                removed: Vec::new(),
                updated: Vec::new(),
                added,
            });
        }

        let mut updated = Vec::new();
        let mut added = Vec::new();
        for (ck, entry) in self.entries.iter_mut() {
            if self.added.contains(ck) {
                // New entries ship their full state.
                added.push(ReplicatedMapEntryDelta {
                    key: Some(entry.key.clone()),
                    delta: entry.value.get_and_reset_delta(true),
                });
            } else if let Some(delta) = entry.value.get_and_reset_delta(false) {
                updated.push(ReplicatedMapEntryDelta {
                    key: Some(entry.key.clone()),
                    delta: Some(delta),
                });
            }
        }

        if !self.cleared && self.removed.is_empty() && added.is_empty() && updated.is_empty() {
            return None;
        }

        let delta = ReplicatedMapDelta {
            cleared: self.cleared,
            removed: self.removed.values().cloned().collect(),
            updated,
            added,
        };
        self.added.clear();
        self.removed.clear();
        self.cleared = false;
        Some(delta)
    }

    pub fn apply_delta(
        &mut self,
        delta: &ReplicatedMapDelta,
        any_support: &AnySupport,
    ) -> Result<(), CrdtError> {
        if delta.cleared {
            self.entries.clear();
        }

        for key in &delta.removed {
            let ck = any_support.to_comparable(key)?;
            if self.entries.remove(&ck).is_none() {
                debug!(type_url = %key.type_url, "Ignoring remove of absent map key");
            }
        }

        for entry in &delta.added {
            let key = entry.key.as_ref().ok_or(CrdtError::MissingEntryDelta)?;
            let entry_delta = entry.delta.as_ref().ok_or(CrdtError::MissingEntryDelta)?;
            let ck = any_support.to_comparable(key)?;
            match self.entries.get_mut(&ck) {
                Some(existing) => {
                    debug!(type_url = %key.type_url, "Map key already present; folding add into it");
                    existing.value.apply_delta(entry_delta, any_support)?;
                }
                None => {
                    let mut value = ReplicatedData::from_delta(entry_delta)?;
                    value.apply_delta(entry_delta, any_support)?;
                    self.entries.insert(
                        ck,
                        MapEntry {
                            key: key.clone(),
                            value,
                        },
                    );
                }
            }
        }

        for entry in &delta.updated {
            let key = entry.key.as_ref().ok_or(CrdtError::MissingEntryDelta)?;
            let entry_delta = entry.delta.as_ref().ok_or(CrdtError::MissingEntryDelta)?;
            let ck = any_support.to_comparable(key)?;
            match self.entries.get_mut(&ck) {
                Some(existing) => existing.value.apply_delta(entry_delta, any_support)?,
                None => {
                    debug!(type_url = %key.type_url, "Ignoring delta for unknown map key");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::any_support::PrimitiveValue;
    use crate::crdt::Counter;
    use prost_reflect::DescriptorPool;

    fn any_support() -> AnySupport {
        AnySupport::new(DescriptorPool::new())
    }

    fn key(s: &str) -> Any {
        any_support().encode_primitive(PrimitiveValue::String(s.to_string()))
    }

    fn counter(value: i64) -> ReplicatedData {
        let mut counter = Counter::new();
        counter.increment(value);
        ReplicatedData::Counter(counter)
    }

    fn counter_value(data: &ReplicatedData) -> i64 {
        match data {
            ReplicatedData::Counter(c) => c.value(),
            other => panic!("expected counter, got {}", other.kind()),
        }
    }

    #[test]
    fn test_set_and_get() {
        let mut map = ReplicatedMap::new();
        map.set(key("a"), counter(3));
        assert_eq!(counter_value(map.get(&key("a")).unwrap()), 3);
        assert!(map.get(&key("b")).is_none());
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn test_added_entry_ships_full_state() {
        let mut map = ReplicatedMap::new();
        map.set(key("a"), counter(3));

        let delta = map.get_and_reset_delta(false).unwrap();
        assert_eq!(delta.added.len(), 1);
        assert!(delta.updated.is_empty());
    }

    #[test]
    fn test_updated_entry_ships_sub_delta() {
        let mut map = ReplicatedMap::new();
        map.set(key("a"), counter(3));
        map.get_and_reset_delta(false);

        match map.get_mut(&key("a")).unwrap() {
            ReplicatedData::Counter(c) => c.increment(2),
            _ => unreachable!(),
        }

        let delta = map.get_and_reset_delta(false).unwrap();
        assert!(delta.added.is_empty());
        assert_eq!(delta.updated.len(), 1);
    }

    #[test]
    fn test_readd_after_delete_carries_both() {
        let mut map = ReplicatedMap::new();
        map.set(key("a"), counter(3));
        map.get_and_reset_delta(false);

        map.delete(&key("a"));
        map.set(key("a"), counter(9));

        let delta = map.get_and_reset_delta(false).unwrap();
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.added.len(), 1);

        // State is normalized after the flush.
        assert!(map.get_and_reset_delta(false).is_none());
    }

    #[test]
    fn test_set_existing_key_is_remove_then_add() {
        let mut map = ReplicatedMap::new();
        map.set(key("a"), counter(3));
        map.get_and_reset_delta(false);

        map.set(key("a"), counter(10));

        let delta = map.get_and_reset_delta(false).unwrap();
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(counter_value(map.get(&key("a")).unwrap()), 10);
    }

    #[test]
    fn test_default_callback_tracks_addition() {
        let mut map = ReplicatedMap::new();
        let value = map.get_or_create(&key("a"), || Some(ReplicatedData::Counter(Counter::new())));
        assert!(value.is_some());

        let none = map.get_or_create(&key("b"), || None);
        assert!(none.is_none());

        let delta = map.get_and_reset_delta(false).unwrap();
        assert_eq!(delta.added.len(), 1);
        assert!(!map.has(&key("b")));
    }

    #[test]
    fn test_delete_then_flush_carries_removed_key() {
        let mut map = ReplicatedMap::new();
        map.set(key("a"), counter(1));
        map.get_and_reset_delta(false);

        assert!(map.delete(&key("a")));
        let delta = map.get_and_reset_delta(false).unwrap();
        assert_eq!(delta.removed.len(), 1);
        assert!(delta.added.is_empty());
    }

    #[test]
    fn test_add_then_delete_in_same_window_nets_out() {
        let mut map = ReplicatedMap::new();
        map.set(key("a"), counter(1));
        map.get_and_reset_delta(false);

        map.set(key("b"), counter(2));
        map.delete(&key("b"));
        assert!(map.get_and_reset_delta(false).is_none());
    }

    #[test]
    fn test_apply_delta_converges_on_fresh_replica() {
        let support = any_support();
        let mut map = ReplicatedMap::new();
        map.set(key("a"), counter(3));
        map.set(key("b"), counter(4));
        let delta = map.get_and_reset_delta(false).unwrap();

        let mut replica = ReplicatedMap::new();
        replica
            .apply_delta(&delta, &support)
            .unwrap();
        assert_eq!(replica.size(), 2);
        assert_eq!(counter_value(replica.get(&key("a")).unwrap()), 3);

        // A further local change flows as an update.
        match map.get_mut(&key("a")).unwrap() {
            ReplicatedData::Counter(c) => c.increment(2),
            _ => unreachable!(),
        }
        let update = map.get_and_reset_delta(false).unwrap();
        replica.apply_delta(&update, &support).unwrap();
        assert_eq!(counter_value(replica.get(&key("a")).unwrap()), 5);
    }

    #[test]
    fn test_clear_flushes_cleared_flag() {
        let mut map = ReplicatedMap::new();
        map.set(key("a"), counter(1));
        map.get_and_reset_delta(false);

        map.clear();
        let delta = map.get_and_reset_delta(false).unwrap();
        assert!(delta.cleared);
        assert!(map.is_empty());
    }
}
