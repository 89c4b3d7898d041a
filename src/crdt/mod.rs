//! Replicated data types.
//!
//! Each type tracks its own changes since the last flush. The host calls
//! [`ReplicatedData::get_and_reset_delta`] after every command to ship the
//! accumulated delta to the proxy, and [`ReplicatedData::apply_delta`] to
//! fold in deltas merged from other replicas. Convergence comes from each
//! type's merge law; the proxy only relays deltas.

mod counter;
mod counter_map;
mod map;
mod multi_map;
mod register;
mod register_map;
mod set;
mod vote;

pub use counter::Counter;
pub use counter_map::CounterMap;
pub use map::ReplicatedMap;
pub use multi_map::MultiMap;
pub use register::{Clock, Register};
pub use register_map::RegisterMap;
pub use set::ReplicatedSet;
pub use vote::Vote;

use crate::any_support::{AnySupport, AnySupportError};
use crate::proto::{replicated_entity_delta, ReplicatedEntityDelta};

/// Errors from replicated data handling.
#[derive(Debug, thiserror::Error)]
pub enum CrdtError {
    #[error("Delta has no recognized replicated data kind")]
    UnknownKind,

    #[error("Delta kind mismatch: state is {state}, delta is {delta}")]
    KindMismatch {
        state: &'static str,
        delta: &'static str,
    },

    #[error("Map entry delta is missing its payload")]
    MissingEntryDelta,

    #[error(transparent)]
    Any(#[from] AnySupportError),
}

/// The top-level state of a replicated entity: one of the eight types.
#[derive(Debug, Clone)]
pub enum ReplicatedData {
    Counter(Counter),
    Register(Register),
    Set(ReplicatedSet),
    Map(ReplicatedMap),
    CounterMap(CounterMap),
    RegisterMap(RegisterMap),
    MultiMap(MultiMap),
    Vote(Vote),
}

impl ReplicatedData {
    /// The kind name, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicatedData::Counter(_) => "Counter",
            ReplicatedData::Register(_) => "Register",
            ReplicatedData::Set(_) => "ReplicatedSet",
            ReplicatedData::Map(_) => "ReplicatedMap",
            ReplicatedData::CounterMap(_) => "CounterMap",
            ReplicatedData::RegisterMap(_) => "RegisterMap",
            ReplicatedData::MultiMap(_) => "MultiMap",
            ReplicatedData::Vote(_) => "Vote",
        }
    }

    /// Construct an empty instance of the kind the delta envelope is
    /// tagged with. The caller applies the delta afterwards.
    pub fn from_delta(delta: &ReplicatedEntityDelta) -> Result<Self, CrdtError> {
        use replicated_entity_delta::Delta;
        Ok(match delta.delta.as_ref().ok_or(CrdtError::UnknownKind)? {
            Delta::Counter(_) => ReplicatedData::Counter(Counter::new()),
            Delta::Register(_) => ReplicatedData::Register(Register::new()),
            Delta::ReplicatedSet(_) => ReplicatedData::Set(ReplicatedSet::new()),
            Delta::ReplicatedMap(_) => ReplicatedData::Map(ReplicatedMap::new()),
            Delta::ReplicatedCounterMap(_) => ReplicatedData::CounterMap(CounterMap::new()),
            Delta::ReplicatedRegisterMap(_) => ReplicatedData::RegisterMap(RegisterMap::new()),
            Delta::ReplicatedMultiMap(_) => ReplicatedData::MultiMap(MultiMap::new()),
            Delta::Vote(_) => ReplicatedData::Vote(Vote::new()),
        })
    }

    /// Changes since the last flush, wrapped in the wire envelope, or None
    /// when nothing changed. `initial` forces a delta that recreates the
    /// full current state on a fresh replica.
    pub fn get_and_reset_delta(&mut self, initial: bool) -> Option<ReplicatedEntityDelta> {
        use replicated_entity_delta::Delta;
        let delta = match self {
            ReplicatedData::Counter(c) => c.get_and_reset_delta(initial).map(Delta::Counter),
            ReplicatedData::Register(r) => r.get_and_reset_delta(initial).map(Delta::Register),
            ReplicatedData::Set(s) => s.get_and_reset_delta(initial).map(Delta::ReplicatedSet),
            ReplicatedData::Map(m) => m.get_and_reset_delta(initial).map(Delta::ReplicatedMap),
            ReplicatedData::CounterMap(m) => m
                .get_and_reset_delta(initial)
                .map(Delta::ReplicatedCounterMap),
            ReplicatedData::RegisterMap(m) => m
                .get_and_reset_delta(initial)
                .map(Delta::ReplicatedRegisterMap),
            ReplicatedData::MultiMap(m) => m
                .get_and_reset_delta(initial)
                .map(Delta::ReplicatedMultiMap),
            ReplicatedData::Vote(v) => v.get_and_reset_delta(initial).map(Delta::Vote),
        };
        delta.map(|d| ReplicatedEntityDelta { delta: Some(d) })
    }

    /// Fold an inbound delta into current state.
    ///
    /// Redundant adds and removes already observed locally are logged and
    /// ignored, keeping application idempotent.
    pub fn apply_delta(
        &mut self,
        delta: &ReplicatedEntityDelta,
        any_support: &AnySupport,
    ) -> Result<(), CrdtError> {
        use replicated_entity_delta::Delta;
        let tagged = delta.delta.as_ref().ok_or(CrdtError::UnknownKind)?;
        match (self, tagged) {
            (ReplicatedData::Counter(c), Delta::Counter(d)) => {
                c.apply_delta(d);
                Ok(())
            }
            (ReplicatedData::Register(r), Delta::Register(d)) => {
                r.apply_delta(d);
                Ok(())
            }
            (ReplicatedData::Set(s), Delta::ReplicatedSet(d)) => s.apply_delta(d, any_support),
            (ReplicatedData::Map(m), Delta::ReplicatedMap(d)) => m.apply_delta(d, any_support),
            (ReplicatedData::CounterMap(m), Delta::ReplicatedCounterMap(d)) => {
                m.apply_delta(d, any_support)
            }
            (ReplicatedData::RegisterMap(m), Delta::ReplicatedRegisterMap(d)) => {
                m.apply_delta(d, any_support)
            }
            (ReplicatedData::MultiMap(m), Delta::ReplicatedMultiMap(d)) => {
                m.apply_delta(d, any_support)
            }
            (ReplicatedData::Vote(v), Delta::Vote(d)) => {
                v.apply_delta(d);
                Ok(())
            }
            (state, tagged) => Err(CrdtError::KindMismatch {
                state: state.kind(),
                delta: delta_kind(tagged),
            }),
        }
    }
}

fn delta_kind(delta: &replicated_entity_delta::Delta) -> &'static str {
    use replicated_entity_delta::Delta;
    match delta {
        Delta::Counter(_) => "Counter",
        Delta::Register(_) => "Register",
        Delta::ReplicatedSet(_) => "ReplicatedSet",
        Delta::ReplicatedMap(_) => "ReplicatedMap",
        Delta::ReplicatedCounterMap(_) => "CounterMap",
        Delta::ReplicatedRegisterMap(_) => "RegisterMap",
        Delta::ReplicatedMultiMap(_) => "MultiMap",
        Delta::Vote(_) => "Vote",
    }
}
