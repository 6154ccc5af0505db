use std::fmt;

use crate::net::codec::{CodecError, Serialize, Stream};

/// Wrapping 8-bit tick sequence. Ordering is only meaningful between values
/// less than 128 apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sequence(pub u8);

impl Sequence {
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    pub fn prev(self) -> Self {
        Self(self.0.wrapping_sub(1))
    }

    /// Signed distance from `other` to `self`.
    pub fn diff(self, other: Sequence) -> i8 {
        self.0.wrapping_sub(other.0) as i8
    }

    pub fn is_newer_than(self, other: Sequence) -> bool {
        self.diff(other) > 0
    }

    pub fn is_older_than(self, other: Sequence) -> bool {
        self.diff(other) < 0
    }

    pub fn offset(self, by: u8) -> Self {
        Self(self.0.wrapping_add(by))
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Serialize for Sequence {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        stream.io(&mut self.0)?;
        Ok(())
    }
}
