//! A map of last-writer-wins registers.

use std::collections::HashMap;

use prost_types::Any;
use tracing::debug;

use crate::any_support::{comparable_key, AnySupport, ComparableKey};
use crate::crdt::{Clock, CrdtError, Register};
use crate::proto::{ReplicatedRegisterMapDelta, ReplicatedRegisterMapEntryDelta};

#[derive(Debug, Clone)]
struct RegisterMapEntry {
    key: Any,
    register: Register,
}

/// Replicated map of registers. Registers self-create on first set.
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    entries: HashMap<ComparableKey, RegisterMapEntry>,
    removed: HashMap<ComparableKey, Any>,
    cleared: bool,
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The register value for a key, if present and assigned.
    pub fn get(&self, key: &Any) -> Option<&Any> {
        self.entries
            .get(&comparable_key(key))
            .and_then(|e| e.register.value())
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

    /// Assign the register for a key under the default clock.
    pub fn set(&mut self, key: Any, value: Any) {
        self.set_with_clock(key, value, Clock::Default, 0);
    }

    /// Assign the register for a key under an explicit clock.
    pub fn set_with_clock(&mut self, key: Any, value: Any, clock: Clock, custom_clock_value: i64) {
        let ck = comparable_key(&key);
        self.entries
            .entry(ck)
            .or_insert_with(|| RegisterMapEntry {
                key,
                register: Register::new(),
            })
            .register
            .set_value_with_clock(value, clock, custom_clock_value);
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

    pub fn get_and_reset_delta(
        &mut self,
        initial: bool,
    ) -> Option<ReplicatedRegisterMapDelta> {
        let mut updated = Vec::new();
        for entry in self.entries.values_mut() {
            if let Some(delta) = entry.register.get_and_reset_delta(initial) {
                updated.push(ReplicatedRegisterMapEntryDelta {
                    key: Some(entry.key.clone()),
                    delta: Some(delta),
                });
            }
        }

        if initial {
            self.removed.clear();
            self.cleared = false;
            return Some(ReplicatedRegisterMapDelta {
                cleared: false,
                removed: Vec::new(),
                updated,
            });
        }

        if !self.cleared && self.removed.is_empty() && updated.is_empty() {
            return None;
        }

        let delta = ReplicatedRegisterMapDelta {
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
        delta: &ReplicatedRegisterMapDelta,
        any_support: &AnySupport,
    ) -> Result<(), CrdtError> {
        if delta.cleared {
            self.entries.clear();
        }
        for key in &delta.removed {
            let ck = any_support.to_comparable(key)?;
            if self.entries.remove(&ck).is_none() {
                debug!(type_url = %key.type_url, "Ignoring remove of absent register map key");
            }
        }
        for entry in &delta.updated {
            let key = entry.key.as_ref().ok_or(CrdtError::MissingEntryDelta)?;
            let register_delta = entry.delta.as_ref().ok_or(CrdtError::MissingEntryDelta)?;
            let ck = any_support.to_comparable(key)?;
            self.entries
                .entry(ck)
                .or_insert_with(|| RegisterMapEntry {
                    key: key.clone(),
                    register: Register::new(),
                })
                .register
                .apply_delta(register_delta);
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

    fn prim(s: &str) -> Any {
        any_support().encode_primitive(PrimitiveValue::String(s.to_string()))
    }

    #[test]
    fn test_set_and_get() {
        let mut map = RegisterMap::new();
        map.set(prim("k"), prim("v"));
        assert_eq!(map.get(&prim("k")), Some(&prim("v")));
        assert!(map.get(&prim("other")).is_none());
    }

    #[test]
    fn test_delta_ships_changed_registers_only() {
        let mut map = RegisterMap::new();
        map.set(prim("a"), prim("1"));
        map.set(prim("b"), prim("2"));
        map.get_and_reset_delta(false);

        map.set(prim("a"), prim("3"));
        let delta = map.get_and_reset_delta(false).unwrap();
        assert_eq!(delta.updated.len(), 1);
    }

    #[test]
    fn test_replica_converges() {
        let support = any_support();
        let mut map = RegisterMap::new();
        map.set(prim("k"), prim("v1"));
        let d1 = map.get_and_reset_delta(false).unwrap();

        let mut replica = RegisterMap::new();
        replica.apply_delta(&d1, &support).unwrap();
        assert_eq!(replica.get(&prim("k")), Some(&prim("v1")));

        map.set(prim("k"), prim("v2"));
        let d2 = map.get_and_reset_delta(false).unwrap();
        replica.apply_delta(&d2, &support).unwrap();
        assert_eq!(replica.get(&prim("k")), Some(&prim("v2")));
    }

    #[test]
    fn test_delete_and_clear() {
        let mut map = RegisterMap::new();
        map.set(prim("a"), prim("1"));
        map.get_and_reset_delta(false);

        assert!(map.delete(&prim("a")));
        let delta = map.get_and_reset_delta(false).unwrap();
        assert_eq!(delta.removed.len(), 1);

        map.set(prim("b"), prim("2"));
        map.clear();
        let delta = map.get_and_reset_delta(false).unwrap();
        assert!(delta.cleared);
        assert!(map.is_empty());
    }

    #[test]
    fn test_initial_delta_recreates_state() {
        let support = any_support();
        let mut map = RegisterMap::new();
        map.set(prim("a"), prim("1"));
        map.get_and_reset_delta(false);

        let initial = map.get_and_reset_delta(true).unwrap();
        let mut fresh = RegisterMap::new();
        fresh.apply_delta(&initial, &support).unwrap();
        assert_eq!(fresh.get(&prim("a")), Some(&prim("1")));
    }
}
