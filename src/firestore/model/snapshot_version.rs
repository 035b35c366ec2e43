use std::fmt::{Display, Formatter};

use crate::firestore::model::Timestamp;

/// Version of a document or of the whole remote snapshot, as assigned by the
/// backend's read/commit time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotVersion {
    timestamp: Timestamp,
}

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    /// Sentinel for "no version", smaller than every real version.
    pub fn min() -> Self {
        Self::new(Timestamp::new(0, 0))
    }

    /// Sentinel larger than every real version.
    pub fn max() -> Self {
        Self::new(Timestamp::new(253_402_300_799, 999_999_999))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn to_micros(&self) -> i64 {
        self.timestamp.to_micros()
    }
}

impl From<Timestamp> for SnapshotVersion {
    fn from(timestamp: Timestamp) -> Self {
        Self::new(timestamp)
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SnapshotVersion({}s {}ns)",
            self.timestamp.seconds, self.timestamp.nanos
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_and_max_bound_real_versions() {
        let version = SnapshotVersion::new(Timestamp::new(1_000, 5));
        assert!(SnapshotVersion::min() < version);
        assert!(version < SnapshotVersion::max());
        assert!(SnapshotVersion::default().is_min());
    }
}
