//! MTConnect schema versions
//!
//! The effective version decides which device-level data items intake must
//! create and which namespace the probe document advertises.

use std::fmt;

/// A `major.minor` MTConnect schema version, ordered numerically
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    pub const V1_2: SchemaVersion = SchemaVersion::new(1, 2);
    pub const V1_3: SchemaVersion = SchemaVersion::new(1, 3);
    pub const V1_5: SchemaVersion = SchemaVersion::new(1, 5);
    pub const V1_7: SchemaVersion = SchemaVersion::new(1, 7);
    pub const V2_0: SchemaVersion = SchemaVersion::new(2, 0);

    /// Highest version this agent implements; the default when neither the
    /// configuration nor the descriptor names one.
    pub const DEFAULT: SchemaVersion = SchemaVersion::new(2, 2);

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse "major.minor"; trailing fields are ignored.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some(Self { major, minor })
    }

    /// Extract the version from an MTConnect namespace urn, e.g.
    /// `urn:mtconnect.org:MTConnectDevices:1.7`.
    pub fn from_namespace(ns: &str) -> Option<Self> {
        ns.rsplit(':').next().and_then(Self::parse)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
