//! Link protocol versioning.
//!
//! A world announces its link version in `Authenticate`. The hub accepts
//! worlds on its own major whose minor it already understands, so a hub is
//! always upgraded before the worlds linking to it.

use serde::{Deserialize, Serialize};

/// Link version spoken by this build.
pub const LINK_VERSION: Version = Version::new(1, 0);

/// A `major.minor` link version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Whether a hub speaking `self` can serve a world speaking `peer`.
    #[must_use]
    pub fn accepts(&self, peer: &Version) -> bool {
        self.major == peer.major && peer.minor <= self.minor
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        LINK_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_accepts_older_minor_only() {
        let hub = Version::new(1, 2);
        assert!(hub.accepts(&Version::new(1, 0)));
        assert!(hub.accepts(&Version::new(1, 2)));
        assert!(!hub.accepts(&Version::new(1, 3)));
        assert!(!hub.accepts(&Version::new(2, 0)));
        assert_eq!(Version::new(1, 3).to_string(), "1.3");
    }
}
