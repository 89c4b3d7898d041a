//! A map of counters.

use std::collections::HashMap;

use prost_types::Any;
use tracing::debug;

use crate::any_support::{comparable_key, AnySupport, ComparableKey};
use crate::crdt::{Counter, CrdtError};
use crate::proto::{ReplicatedCounterMapDelta, ReplicatedCounterMapEntryDelta};

#[derive(Debug, Clone)]
struct CounterMapEntry {
    key: Any,
    counter: Counter,
}

/// Replicated map of counters. Counters self-create on first increment,
/// locally and when applying deltas, so the delta carries only updates and
/// removals.
#[derive(Debug, Clone, Default)]
pub struct CounterMap {
    entries: HashMap<ComparableKey, CounterMapEntry>,
    removed: HashMap<ComparableKey, Any>,
    cleared: bool,
}

impl CounterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The value of the counter for a key, if present.
    pub fn get(&self, key: &Any) -> Option<i64> {
        self.entries
            .get(&comparable_key(key))
            .map(|e| e.counter.value())
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

    /// Increment the counter for a key, creating it at zero when absent.
    pub fn increment(&mut self, key: Any, by: i64) {
        self.entry(key).counter.increment(by);
    }

    /// Decrement the counter for a key, creating it at zero when absent.
    pub fn decrement(&mut self, key: Any, by: i64) {
        self.entry(key).counter.decrement(by);
    }

    /// Remove a key. Returns false when it was not present.
    pub fn delete(&mut self, key: &Any) -> bool {
        let ck = comparable_key(key);
        match self.entries.remove(&ck) {
            None => false,
            Some(entry) => {
                self.removed.insert(ck, entry.key);
                true
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.removed.clear();
        self.cleared = true;
    }

    fn entry(&mut self, key: Any) -> &mut CounterMapEntry {
        let ck = comparable_key(&key);
        // A key recreated after a same-window delete keeps the removal on
        // record; the fresh counter ships its full value alongside it.
        self.entries.entry(ck).or_insert_with(|| CounterMapEntry {
            key,
            counter: Counter::new(),
        })
    }

    pub fn get_and_reset_delta(
        &mut self,
        initial: bool,
    ) -> Option<ReplicatedCounterMapDelta> {
        let mut updated = Vec::new();
        for entry in self.entries.values_mut() {
            if let Some(delta) = entry.counter.get_and_reset_delta(initial) {
                updated.push(ReplicatedCounterMapEntryDelta {
                    key: Some(entry.key.clone()),
                    delta: Some(delta),
                });
            }
        }

        if initial {
            self.removed.clear();
            self.cleared = false;
            return Some(ReplicatedCounterMapDelta {
                cleared: false,
                removed: Vec::new(),
                updated,
            });
        }

        if !self.cleared && self.removed.is_empty() && updated.is_empty() {
            return None;
        }

        let delta = ReplicatedCounterMapDelta {
            cleared: self.cleared,
            removed: self.removed.values().cloned().collect(),
            updated,
        };
        self.removed.clear();
        self.cleared = false;
        Some(delta)
    }

    pub fn apply_delta(
        &mut self,
        delta: &ReplicatedCounterMapDelta,
        any_support: &AnySupport,
    ) -> Result<(), CrdtError> {
        if delta.cleared {
            self.entries.clear();
        }
        for key in &delta.removed {
            let ck = any_support.to_comparable(key)?;
            if self.entries.remove(&ck).is_none() {
                debug!(type_url = %key.type_url, "Ignoring remove of absent counter map key");
            }
        }
        for entry in &delta.updated {
            let key = entry.key.as_ref().ok_or(CrdtError::MissingEntryDelta)?;
            let change = entry.delta.as_ref().ok_or(CrdtError::MissingEntryDelta)?;
            any_support.to_comparable(key)?;
            self.entry(key.clone()).counter.apply_delta(change);
        }
        Ok(())
    }
}
