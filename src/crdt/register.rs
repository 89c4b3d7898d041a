//! A register holding a single value, last-writer-wins.

use prost_types::Any;

use crate::proto::{ReplicatedEntityClock, ReplicatedRegisterDelta};

/// Clock used to order concurrent register assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Clock {
    /// The proxy's wall clock.
    #[default]
    Default,
    /// Reversed ordering: the earliest write wins.
    Reverse,
    /// A caller-supplied clock value.
    Custom,
    /// Caller-supplied, auto-incremented past the previous value when the
    /// caller does not supply one.
    CustomAutoIncrement,
}

impl Clock {
    fn to_proto(self) -> ReplicatedEntityClock {
        match self {
            Clock::Default => ReplicatedEntityClock::DefaultUnspecified,
            Clock::Reverse => ReplicatedEntityClock::Reverse,
            Clock::Custom => ReplicatedEntityClock::Custom,
            Clock::CustomAutoIncrement => ReplicatedEntityClock::CustomAutoIncrement,
        }
    }

    fn from_proto(clock: i32) -> Self {
        match ReplicatedEntityClock::try_from(clock) {
            Ok(ReplicatedEntityClock::Reverse) => Clock::Reverse,
            Ok(ReplicatedEntityClock::Custom) => Clock::Custom,
            Ok(ReplicatedEntityClock::CustomAutoIncrement) => Clock::CustomAutoIncrement,
            _ => Clock::Default,
        }
    }
}

/// Replicated register. Concurrent assignments resolve by (clock, custom
/// clock value); the proxy performs the resolution and relays the winner.
#[derive(Debug, Clone, Default)]
pub struct Register {
    value: Option<Any>,
    clock: Clock,
    custom_clock_value: i64,
    changed: bool,
}

impl Register {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current value, if one has been assigned.
    pub fn value(&self) -> Option<&Any> {
        self.value.as_ref()
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn custom_clock_value(&self) -> i64 {
        self.custom_clock_value
    }

    /// Assign a value under the default clock.
    pub fn set_value(&mut self, value: Any) {
        self.set_value_with_clock(value, Clock::Default, 0);
    }

    /// Assign a value under an explicit clock.
    ///
    /// With [`Clock::CustomAutoIncrement`] and `custom_clock_value == 0`,
    /// the clock advances one past its previous value.
    pub fn set_value_with_clock(&mut self, value: Any, clock: Clock, custom_clock_value: i64) {
        self.custom_clock_value = match clock {
            Clock::CustomAutoIncrement if custom_clock_value == 0 => self.custom_clock_value + 1,
            Clock::Custom | Clock::CustomAutoIncrement => custom_clock_value,
            _ => 0,
        };
        self.value = Some(value);
        self.clock = clock;
        self.changed = true;
    }

    pub fn get_and_reset_delta(&mut self, initial: bool) -> Option<ReplicatedRegisterDelta> {
        if !self.changed && !initial {
            return None;
        }
        self.changed = false;
        Some(ReplicatedRegisterDelta {
            value: self.value.clone(),
            clock: self.clock.to_proto() as i32,
            custom_clock_value: self.custom_clock_value,
        })
    }

    pub fn apply_delta(&mut self, delta: &ReplicatedRegisterDelta) {
        self.value = delta.value.clone();
        self.clock = Clock::from_proto(delta.clock);
        self.custom_clock_value = delta.custom_clock_value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any(s: &str) -> Any {
        Any {
            type_url: "p.statehost.io/string".to_string(),
            value: s.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_fresh_register_is_empty() {
        let mut register = Register::new();
        assert!(register.value().is_none());
        assert!(register.get_and_reset_delta(false).is_none());
    }

    #[test]
    fn test_set_value_flushes_once() {
        let mut register = Register::new();
        register.set_value(any("a"));

        let delta = register.get_and_reset_delta(false).unwrap();
        assert_eq!(delta.value, Some(any("a")));
        assert!(register.get_and_reset_delta(false).is_none());
    }

    #[test]
    fn test_last_assignment_wins_locally() {
        let mut register = Register::new();
        register.set_value(any("a"));
        register.set_value(any("b"));

        let delta = register.get_and_reset_delta(false).unwrap();
        assert_eq!(delta.value, Some(any("b")));
        assert_eq!(register.value(), Some(&any("b")));
    }

    #[test]
    fn test_custom_clock_carried_in_delta() {
        let mut register = Register::new();
        register.set_value_with_clock(any("a"), Clock::Custom, 42);

        let delta = register.get_and_reset_delta(false).unwrap();
        assert_eq!(delta.clock, ReplicatedEntityClock::Custom as i32);
        assert_eq!(delta.custom_clock_value, 42);
    }

    #[test]
    fn test_auto_increment_advances_clock() {
        let mut register = Register::new();
        register.set_value_with_clock(any("a"), Clock::CustomAutoIncrement, 10);
        register.set_value_with_clock(any("b"), Clock::CustomAutoIncrement, 0);
        assert_eq!(register.custom_clock_value(), 11);
    }

    #[test]
    fn test_apply_delta_installs_value() {
        let mut register = Register::new();
        register.apply_delta(&ReplicatedRegisterDelta {
            value: Some(any("remote")),
            clock: ReplicatedEntityClock::Reverse as i32,
            custom_clock_value: 0,
        });
        assert_eq!(register.value(), Some(&any("remote")));
        assert_eq!(register.clock(), Clock::Reverse);
        // Applying an inbound delta does not mark a local change.
        assert!(register.get_and_reset_delta(false).is_none());
    }

    #[test]
    fn test_initial_delta_recreates_state() {
        let mut register = Register::new();
        register.set_value(any("a"));
        register.get_and_reset_delta(false);

        let initial = register.get_and_reset_delta(true).unwrap();
        let mut fresh = Register::new();
        fresh.apply_delta(&initial);
        assert_eq!(fresh.value(), Some(&any("a")));
    }
}
