//! The `(major, minor)` protocol version pair.
//!
//! Wire messages carry versions as signed 16-bit integers so garbage from a
//! misbehaving peer survives decoding; a [`ProtocolVersion`] can only be
//! constructed from values that satisfy the validity rule (`major >= 1`,
//! `minor >= 0`), which keeps every later stage – the dispatch table, the
//! registry, the logs – free of impossible versions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A validated protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Creates a version from already-validated parts.
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Validates the signed wire fields of a hello reply.
    ///
    /// Returns `None` when `major <= 0` or `minor < 0` – such values are
    /// never valid regardless of what any dispatch table supports.
    pub fn from_wire(major: i16, minor: i16) -> Option<Self> {
        if major <= 0 || minor < 0 {
            return None;
        }
        Some(Self {
            major: major as u16,
            minor: minor as u16,
        })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
