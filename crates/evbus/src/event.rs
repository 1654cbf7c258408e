//! Event primitives.

use std::fmt;

/// Identifies the component an event originated from.
///
/// `0` is reserved as the [`ID_ANY`] wildcard and is never a real source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub u16);

/// Identifies what happened at a source.
///
/// `0` is reserved as the [`EVENT_ANY`] wildcard and is never a real value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventValue(pub u16);

/// Wildcard source: a listener registered with it matches every source.
pub const ID_ANY: SourceId = SourceId(0);

/// Wildcard value: a listener registered with it matches every value.
pub const EVENT_ANY: EventValue = EventValue(0);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A timestamped occurrence delivered through the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Component the event originated from.
    pub source: SourceId,
    /// What happened at the source.
    pub value: EventValue,
    /// Scheduler clock, in milliseconds, at the moment of posting.
    pub timestamp: u64,
}

impl Event {
    /// Creates an event with an explicit timestamp.
    pub fn new(source: SourceId, value: EventValue, timestamp: u64) -> Self {
        Self {
            source,
            value,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards_share_the_reserved_zero() {
        assert_eq!(ID_ANY.0, 0);
        assert_eq!(EVENT_ANY.0, 0);
    }

    #[test]
    fn display_renders_the_raw_identifier() {
        assert_eq!(SourceId(7).to_string(), "7");
        assert_eq!(EventValue(42).to_string(), "42");
    }
}
