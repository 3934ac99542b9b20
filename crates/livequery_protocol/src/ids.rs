//! Identifiers and positions carried on the wire.

use std::fmt;

/// Client-assigned identifier of one server-side query subscription.
///
/// Allocated monotonically and never reused within an engine, so a late
/// server message for a torn-down subscription cannot reach a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(u32);

impl QueryId {
    /// Creates a query ID from its raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Client-assigned identifier of a mutation or action request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// Creates a request ID from its raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Server log position a transition brings the client to.
///
/// Positions are totally ordered and gap-free within one connection
/// session: every session starts at [`LogPosition::INITIAL`] and each
/// transition carries exactly the successor of the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LogPosition(u64);

impl LogPosition {
    /// Position of a fresh session before any transition.
    pub const INITIAL: LogPosition = LogPosition(0);

    /// Creates a position from its raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The only position that may follow this one.
    pub fn successor(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_successor() {
        assert_eq!(LogPosition::INITIAL.successor(), LogPosition::new(1));
        assert!(LogPosition::new(2) > LogPosition::new(1));
        assert_eq!(LogPosition::new(u64::MAX).successor(), LogPosition::new(u64::MAX));
    }

    #[test]
    fn display_forms() {
        assert_eq!(QueryId::new(3).to_string(), "q3");
        assert_eq!(RequestId::new(9).to_string(), "r9");
        assert_eq!(LogPosition::new(12).to_string(), "@12");
    }
}
