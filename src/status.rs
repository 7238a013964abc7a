//! Combined connectivity and alarm state of a connection.

use std::fmt;

use crate::dbr::AlarmStatus;

/// A single named state. Each state occupies its own bit of a [`Status`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum State {
    /// Connection created, remote channel not yet seen
    Initial,
    Connected,
    /// Initial connection did not happen in time
    Failed,
    /// Was connected, remote went away
    Lost,
    /// Destroyed locally or closed remotely. Terminal.
    Closed,
    Warning,
    Alarm,
    Invalid,
    Normal,
    Undefined,
}

impl State {
    pub const ALL: [State; 10] = [
        State::Initial,
        State::Connected,
        State::Failed,
        State::Lost,
        State::Closed,
        State::Warning,
        State::Alarm,
        State::Invalid,
        State::Normal,
        State::Undefined,
    ];
    pub const CONNECTIVITY: [State; 5] = [
        State::Initial,
        State::Connected,
        State::Failed,
        State::Lost,
        State::Closed,
    ];

    pub const fn bit(self) -> u32 {
        1 << self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            State::Initial => "INITIAL",
            State::Connected => "CONNECTED",
            State::Failed => "FAILED",
            State::Lost => "LOST",
            State::Closed => "CLOSED",
            State::Warning => "WARNING",
            State::Alarm => "ALARM",
            State::Invalid => "INVALID",
            State::Normal => "NORMAL",
            State::Undefined => "UNDEFINED",
        }
    }

    pub fn is_connectivity(self) -> bool {
        Self::CONNECTIVITY.contains(&self)
    }

    /// Map a wire alarm severity onto the alarm state it represents
    pub fn from_severity(severity: i16) -> State {
        match severity {
            AlarmStatus::NO_ALARM => State::Normal,
            AlarmStatus::MINOR => State::Warning,
            AlarmStatus::MAJOR => State::Alarm,
            AlarmStatus::INVALID => State::Invalid,
            _ => State::Undefined,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An immutable set of [`State`]s, compared by bitmask
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Status(u32);

const CONNECTIVITY_MASK: u32 = State::Initial.bit()
    | State::Connected.bit()
    | State::Failed.bit()
    | State::Lost.bit()
    | State::Closed.bit();

impl Status {
    pub const EMPTY: Status = Status(0);
    pub const INITIAL: Status = Status(State::Initial.bit());
    pub const CONNECTED: Status = Status(State::Connected.bit());
    pub const CLOSED: Status = Status(State::Closed.bit());
    pub const NORMAL: Status = Status(State::Normal.bit());

    pub fn of(state: State) -> Status {
        Status(state.bit())
    }

    pub fn from_states(states: &[State]) -> Status {
        Status(states.iter().fold(0, |acc, s| acc | s.bit()))
    }

    pub fn from_bits(bits: u32) -> Status {
        Status(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_set(&self, state: State) -> bool {
        self.0 & state.bit() != 0
    }

    /// Return a copy with `state` added
    #[must_use]
    pub fn set(&self, state: State) -> Status {
        Status(self.0 | state.bit())
    }

    /// Return a copy with only `state` removed. Every other bit is preserved.
    #[must_use]
    pub fn unset(&self, state: State) -> Status {
        Status(self.0 & !state.bit())
    }

    /// Union of the two sets
    #[must_use]
    pub fn merge(&self, other: Status) -> Status {
        Status(self.0 | other.0)
    }

    /// Only the connectivity bits of this status
    pub fn connectivity(&self) -> Status {
        Status(self.0 & CONNECTIVITY_MASK)
    }

    /// Only the alarm bits of this status
    pub fn alarm(&self) -> Status {
        Status(self.0 & !CONNECTIVITY_MASK)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn states(&self) -> impl Iterator<Item = State> + '_ {
        State::ALL.into_iter().filter(|s| self.is_set(*s))
    }
}

impl From<State> for Status {
    fn from(value: State) -> Self {
        Status::of(value)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.states().map(State::name).collect();
        write!(f, "[{}]", names.join(","))
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_distinct() {
        let all = State::ALL.iter().fold(0u32, |acc, s| {
            assert_eq!(acc & s.bit(), 0, "{s} shares a bit");
            acc | s.bit()
        });
        assert_eq!(all.count_ones() as usize, State::ALL.len());
    }

    #[test]
    fn set_returns_new_value() {
        let s = Status::INITIAL;
        let t = s.set(State::Normal);
        assert!(!s.is_set(State::Normal));
        assert!(t.is_set(State::Normal));
        assert!(t.is_set(State::Initial));
        assert_eq!(t, Status::from_states(&[State::Normal, State::Initial]));
    }

    /// `unset` must clear exactly one bit, whatever else is combined with it
    #[test]
    fn unset_clears_only_named_bit() {
        for a in State::ALL {
            for b in State::ALL {
                for c in State::ALL {
                    let combined = Status::from_states(&[a, b, c]);
                    let cleared = combined.unset(b);
                    assert!(!cleared.is_set(b));
                    for other in State::ALL.into_iter().filter(|s| *s != b) {
                        assert_eq!(cleared.is_set(other), combined.is_set(other));
                    }
                    // Unsetting an absent bit is a no-op
                    assert_eq!(cleared.unset(b), cleared);
                }
            }
        }
    }

    #[test]
    fn split_connectivity_and_alarm() {
        let s = Status::from_states(&[State::Connected, State::Alarm]);
        assert_eq!(s.connectivity(), Status::CONNECTED);
        assert_eq!(s.alarm(), Status::of(State::Alarm));
        assert_eq!(s.connectivity().merge(s.alarm()), s);
    }

    #[test]
    fn severity_mapping() {
        assert_eq!(State::from_severity(0), State::Normal);
        assert_eq!(State::from_severity(1), State::Warning);
        assert_eq!(State::from_severity(2), State::Alarm);
        assert_eq!(State::from_severity(3), State::Invalid);
        assert_eq!(State::from_severity(17), State::Undefined);
    }

    #[test]
    fn display_lists_names() {
        let s = Status::from_states(&[State::Lost, State::Normal]);
        assert_eq!(s.to_string(), "[LOST,NORMAL]");
    }
}
