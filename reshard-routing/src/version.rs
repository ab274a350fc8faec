//! Chunk versions.
//!
//! A chunk version is `(major, minor, epoch)`. Versions are only comparable
//! within one epoch: a different epoch means the collection was recreated
//! and any cached routing for it is stale.

use std::cmp::Ordering;
use std::fmt;

use reshard_core::Epoch;

/// Version attached to a chunk (and, by taking the maximum, to a shard).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkVersion {
    major: u32,
    minor: u32,
    epoch: Epoch,
}

impl ChunkVersion {
    /// Creates a chunk version.
    #[must_use]
    pub const fn new(major: u32, minor: u32, epoch: Epoch) -> Self {
        Self {
            major,
            minor,
            epoch,
        }
    }

    /// The "no chunks" sentinel for a shard that owns nothing in `epoch`.
    #[must_use]
    pub const fn no_chunks(epoch: Epoch) -> Self {
        Self::new(0, 0, epoch)
    }

    /// Returns true for the "no chunks" sentinel.
    #[must_use]
    pub const fn is_no_chunks(&self) -> bool {
        self.major == 0 && self.minor == 0
    }

    /// Major component; bumped when ownership moves between shards.
    #[must_use]
    pub const fn major(&self) -> u32 {
        self.major
    }

    /// Minor component; bumped on splits and merges.
    #[must_use]
    pub const fn minor(&self) -> u32 {
        self.minor
    }

    /// Epoch of this version.
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Returns true if both versions belong to the same epoch.
    #[must_use]
    pub fn is_same_epoch(&self, other: &Self) -> bool {
        self.epoch == other.epoch
    }

    /// Returns true if `self` is strictly older than `other` in the same epoch.
    ///
    /// Versions from different epochs are never older than each other.
    #[must_use]
    pub fn is_older_than(&self, other: &Self) -> bool {
        matches!(self.partial_cmp(other), Some(Ordering::Less))
    }

    /// Returns the next major version.
    #[must_use]
    pub const fn inc_major(self) -> Self {
        Self::new(self.major + 1, 0, self.epoch)
    }

    /// Returns the next minor version.
    #[must_use]
    pub const fn inc_minor(self) -> Self {
        Self::new(self.major, self.minor + 1, self.epoch)
    }
}

impl PartialOrd for ChunkVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.epoch != other.epoch {
            return None;
        }
        Some((self.major, self.minor).cmp(&(other.major, other.minor)))
    }
}

impl fmt::Debug for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_within_epoch() {
        let epoch = Epoch::new(1);
        let a = ChunkVersion::new(1, 0, epoch);
        let b = ChunkVersion::new(1, 3, epoch);
        let c = ChunkVersion::new(2, 0, epoch);

        assert!(a < b);
        assert!(b < c);
        assert!(a.is_older_than(&c));
        assert!(!c.is_older_than(&a));
    }

    #[test]
    fn test_different_epochs_are_incomparable() {
        let a = ChunkVersion::new(1, 0, Epoch::new(1));
        let b = ChunkVersion::new(5, 0, Epoch::new(2));

        assert_eq!(a.partial_cmp(&b), None);
        assert!(!a.is_older_than(&b));
        assert!(!b.is_older_than(&a));
        assert!(!a.is_same_epoch(&b));
    }

    #[test]
    fn test_increments() {
        let v = ChunkVersion::new(3, 4, Epoch::new(9));
        assert_eq!(v.inc_minor(), ChunkVersion::new(3, 5, Epoch::new(9)));
        assert_eq!(v.inc_major(), ChunkVersion::new(4, 0, Epoch::new(9)));
    }

    #[test]
    fn test_no_chunks_sentinel() {
        let v = ChunkVersion::no_chunks(Epoch::new(1));
        assert!(v.is_no_chunks());
        assert!(!ChunkVersion::new(1, 0, Epoch::new(1)).is_no_chunks());
        assert_eq!(v.to_string(), "0|0||epoch-1");
    }
}
