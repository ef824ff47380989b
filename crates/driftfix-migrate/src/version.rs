use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::MigrationError;

/// A `major.minor.patch` schema version.
///
/// Ordering is numeric per component, so `0.10.0 > 0.9.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    pub const ZERO: SchemaVersion = SchemaVersion::new(0, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Same release line (major and minor agree).
    pub fn same_release_line(&self, other: &SchemaVersion) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl FromStr for SchemaVersion {
    type Err = MigrationError;

    /// Accepts `1`, `1.2`, `1.2.3` and an optional leading `v`. Missing
    /// components are zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if body.is_empty() {
            return Err(MigrationError::InvalidVersion(s.to_string()));
        }

        let mut parts = [0u32; 3];
        let mut count = 0;
        for piece in body.split('.') {
            if count == parts.len() {
                return Err(MigrationError::InvalidVersion(s.to_string()));
            }
            parts[count] = piece
                .parse()
                .map_err(|_| MigrationError::InvalidVersion(s.to_string()))?;
            count += 1;
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
