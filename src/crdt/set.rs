//! A set of opaque elements.

use std::collections::HashMap;

use prost_types::Any;
use tracing::debug;

use crate::any_support::{comparable_key, AnySupport, ComparableKey};
use crate::crdt::CrdtError;
use crate::proto::ReplicatedSetDelta;

/// Replicated set. Elements are compared by their canonical key, so two
/// equal values are one element regardless of where they were encoded.
#[derive(Debug, Clone, Default)]
pub struct ReplicatedSet {
    elements: HashMap<ComparableKey, Any>,
    added: HashMap<ComparableKey, Any>,
    removed: HashMap<ComparableKey, Any>,
    cleared: bool,
}

impl ReplicatedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, value: &Any) -> bool {
        self.elements.contains_key(&comparable_key(value))
    }

    pub fn size(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterate the elements, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Any> {
        self.elements.values()
    }

    /// Add an element. Returns false when it was already present.
    pub fn add(&mut self, value: Any) -> bool {
        let key = comparable_key(&value);
        if self.elements.contains_key(&key) {
            return false;
        }
        if self.removed.remove(&key).is_none() {
            // Not a re-add of a previously flushed element: track it.
            self.added.insert(key.clone(), value.clone());
        }
        self.elements.insert(key, value);
        true
    }

    pub fn add_all(&mut self, values: impl IntoIterator<Item = Any>) {
        for value in values {
            self.add(value);
        }
    }

    /// Remove an element. Returns false when it was not present.
    ///
    /// Removing the last element degrades to a clear; the proxy reconciles
    /// clears, so convergence is unaffected.
    pub fn delete(&mut self, value: &Any) -> bool {
        let key = comparable_key(value);
        if !self.elements.contains_key(&key) {
            return false;
        }
        if self.elements.len() == 1 {
            self.clear();
            return true;
        }
        self.elements.remove(&key);
        if self.added.remove(&key).is_none() {
            self.removed.insert(key, value.clone());
        }
        true
    }

    pub fn clear(&mut self) {
        self.elements.clear();
        self.added.clear();
        self.removed.clear();
        self.cleared = true;
    }

    pub fn get_and_reset_delta(&mut self, initial: bool) -> Option<ReplicatedSetDelta> {
        if initial {
            self.added.clear();
            self.removed.clear();
            self.cleared = false;
            return Some(ReplicatedSetDelta {
                cleared: false,
                removed: Vec::new(),
                added: self.elements.values().cloned().collect(),
            });
        }

        if !self.cleared && self.added.is_empty() && self.removed.is_empty() {
            return None;
        }

        let delta = ReplicatedSetDelta {
            cleared: self.cleared,
            removed: self.removed.values().cloned().collect(),
            added: self.added.values().cloned().collect(),
        };
        self.added.clear();
        self.removed.clear();
        self.cleared = false;
        Some(delta)
    }

    pub fn apply_delta(
        &mut self,
        delta: &ReplicatedSetDelta,
        any_support: &AnySupport,
    ) -> Result<(), CrdtError> {
        if delta.cleared {
            self.elements.clear();
        }
        for value in &delta.removed {
            let key = any_support.to_comparable(value)?;
            if self.elements.remove(&key).is_none() {
                debug!(type_url = %value.type_url, "Ignoring remove of absent set element");
            }
        }
        for value in &delta.added {
            let key = any_support.to_comparable(value)?;
            if self.elements.contains_key(&key) {
                debug!(type_url = %value.type_url, "Ignoring add of present set element");
            } else {
                self.elements.insert(key, value.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::any_support::PrimitiveValue;
    use prost_reflect::DescriptorPool;

    fn any_support() -> AnySupport {
        AnySupport::new(DescriptorPool::new())
    }

    fn element(s: &str) -> Any {
        any_support().encode_primitive(PrimitiveValue::String(s.to_string()))
    }

    #[test]
    fn test_add_and_membership() {
        let mut set = ReplicatedSet::new();
        assert!(set.add(element("a")));
        assert!(!set.add(element("a")));
        assert!(set.has(&element("a")));
        assert_eq!(set.size(), 1);
    }

    #[test]
    fn test_delta_tracks_adds_and_removes() {
        let mut set = ReplicatedSet::new();
        set.add(element("a"));
        set.add(element("b"));
        set.get_and_reset_delta(false);

        set.add(element("c"));
        set.delete(&element("a"));

        let delta = set.get_and_reset_delta(false).unwrap();
        assert!(!delta.cleared);
        assert_eq!(delta.added, vec![element("c")]);
        assert_eq!(delta.removed, vec![element("a")]);
    }

    #[test]
    fn test_add_then_delete_in_same_window_nets_out() {
        let mut set = ReplicatedSet::new();
        set.add(element("a"));
        set.get_and_reset_delta(false);

        set.add(element("b"));
        set.delete(&element("b"));

        assert!(set.get_and_reset_delta(false).is_none());
    }

    #[test]
    fn test_readd_after_delete_in_same_window_nets_out() {
        let mut set = ReplicatedSet::new();
        set.add(element("a"));
        set.add(element("b"));
        set.get_and_reset_delta(false);

        set.delete(&element("a"));
        set.add(element("a"));

        assert!(set.get_and_reset_delta(false).is_none());
        assert!(set.has(&element("a")));
    }

    #[test]
    fn test_delete_last_element_degrades_to_clear() {
        let mut set = ReplicatedSet::new();
        set.add(element("a"));
        set.get_and_reset_delta(false);

        assert!(set.delete(&element("a")));
        assert!(set.is_empty());

        let delta = set.get_and_reset_delta(false).unwrap();
        assert!(delta.cleared);
        assert!(delta.removed.is_empty());
        assert!(delta.added.is_empty());
    }

    #[test]
    fn test_apply_delta_is_idempotent_for_redundant_ops() {
        let support = any_support();
        let mut set = ReplicatedSet::new();
        set.add(element("a"));

        let delta = ReplicatedSetDelta {
            cleared: false,
            removed: vec![element("missing")],
            added: vec![element("a")],
        };
        set.apply_delta(&delta, &support).unwrap();
        assert_eq!(set.size(), 1);
    }

    #[test]
    fn test_initial_delta_recreates_state_on_fresh_replica() {
        let support = any_support();
        let mut set = ReplicatedSet::new();
        set.add(element("a"));
        set.add(element("b"));
        set.get_and_reset_delta(false);

        let initial = set.get_and_reset_delta(true).unwrap();
        let mut fresh = ReplicatedSet::new();
        fresh.apply_delta(&initial, &support).unwrap();
        assert!(fresh.has(&element("a")));
        assert!(fresh.has(&element("b")));
        assert_eq!(fresh.size(), 2);
    }

    #[test]
    fn test_second_flush_without_mutation_is_none() {
        let mut set = ReplicatedSet::new();
        set.add(element("a"));
        assert!(set.get_and_reset_delta(false).is_some());
        assert!(set.get_and_reset_delta(false).is_none());
    }
}
