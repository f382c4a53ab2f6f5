//! Readiness interest masks.

use std::fmt;
use std::ops::BitOr;

/// Set of readiness conditions a channel wants to be woken for.
///
/// Unlike [`mio::Interest`] this can be empty: an empty mask means the
/// channel is parked and will only move again through an explicit transition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InterestOps(u8);

impl InterestOps {
    /// No readiness interest.
    pub const NONE: Self = Self(0);
    /// Read readiness.
    pub const READ: Self = Self(0b01);
    /// Write readiness.
    pub const WRITE: Self = Self(0b10);
    /// Read and write readiness.
    pub const READ_WRITE: Self = Self(0b11);

    /// Whether the mask is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether read readiness is included.
    pub fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    /// Whether write readiness is included.
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    /// Whether every condition of `other` is included.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn to_mio(self) -> Option<mio::Interest> {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for InterestOps {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for InterestOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => f.write_str("READ|WRITE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (false, false) => f.write_str("NONE"),
        }
    }
}
