//! Core identifier types for BurrowDB.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing accidental misuse of different ID types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Block address - an opaque 32-bit token naming an on-disk block.
///
/// Addresses are handed out by the block manager and have no arithmetic
/// meaning to the rest of the engine. `BlockAddr::INVALID` is reserved and
/// never names a real block.
///
/// # Example
///
/// ```rust
/// use burrow_common::types::BlockAddr;
///
/// let addr = BlockAddr::new(42);
/// assert_eq!(addr.as_u32(), 42);
/// assert!(addr.is_valid());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BlockAddr(u32);

impl BlockAddr {
    /// Invalid block address, used as a sentinel value.
    pub const INVALID: Self = Self(u32::MAX);

    /// Creates a new `BlockAddr` from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Checks if this is a valid block address.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "BlockAddr(INVALID)")
        } else {
            write!(f, "BlockAddr({})", self.0)
        }
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for BlockAddr {
    #[inline]
    fn from(addr: u32) -> Self {
        Self::new(addr)
    }
}

impl From<BlockAddr> for u32 {
    #[inline]
    fn from(addr: BlockAddr) -> Self {
        addr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_addr() {
        let addr = BlockAddr::new(7);
        assert_eq!(addr.as_u32(), 7);
        assert!(addr.is_valid());
        assert!(!BlockAddr::INVALID.is_valid());
    }

    #[test]
    fn test_ordering() {
        assert!(BlockAddr::new(1) < BlockAddr::new(2));
    }
}
