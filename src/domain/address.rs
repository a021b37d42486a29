//! Type-safe peer address.
//!
//! [`Address`] is a newtype wrapper around the numeric peer address so that
//! cache keys cannot be confused with other integers (capacities, latencies).

use std::fmt;

/// Numeric address identifying a logical remote peer.
///
/// Used as the key of every store's cache and, through [`Address::topic`],
/// as the topic under which resolved connections are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(i32);

impl Address {
    /// Creates an `Address` from its numeric value.
    #[must_use]
    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    /// Returns the numeric value.
    #[must_use]
    pub const fn get(self) -> i32 {
        self.0
    }

    /// Returns the bus topic for this address: its decimal representation.
    #[must_use]
    pub fn topic(self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for Address {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<Address> for i32 {
    fn from(address: Address) -> Self {
        address.0
    }
}
