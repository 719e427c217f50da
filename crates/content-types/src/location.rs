// SPDX-License-Identifier: Apache-2.0
//! Machine identity as seen by the session.

use serde::{Deserialize, Serialize};

/// Opaque address of a peer cache machine.
///
/// Transport-agnostic: callers may stuff a hostname, a `host:port` pair, or
/// anything their copier understands. The session never parses this string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineLocation(pub String);

impl MachineLocation {
    /// `true` if the location is non-empty and free of embedded NULs — the
    /// only validity the session itself can check without a transport.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && !self.0.contains('\0')
    }
}

impl std::fmt::Display for MachineLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compact integer id the directory assigns to a [`MachineLocation`].
///
/// The session only ever learns its own id (via registration) and otherwise
/// treats ids as opaque keys into `ContentLocationEntry::locations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineId(pub u32);

impl std::fmt::Display for MachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_location_is_invalid() {
        assert!(!MachineLocation(String::new()).is_valid());
    }

    #[test]
    fn location_with_nul_is_invalid() {
        assert!(!MachineLocation("bad\0host".to_string()).is_valid());
    }

    #[test]
    fn ordinary_location_is_valid() {
        assert!(MachineLocation("cache-17.build.internal:7089".to_string()).is_valid());
    }
}
