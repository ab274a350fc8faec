//! Shard-key bounds and chunk ranges.

use std::fmt;

use bytes::Bytes;

/// A position in shard-key space.
///
/// `Min` sorts before every key and `Max` after every key; keys compare
/// lexicographically on their encoded bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyBound {
    /// Lower bound of the key space.
    Min,
    /// An encoded shard-key value.
    Key(Bytes),
    /// Upper bound of the key space.
    Max,
}

impl KeyBound {
    /// Creates a key bound from encoded key bytes.
    #[must_use]
    pub fn key(bytes: impl Into<Bytes>) -> Self {
        Self::Key(bytes.into())
    }
}

impl fmt::Debug for KeyBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for KeyBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Min => f.write_str("MinKey"),
            Self::Max => f.write_str("MaxKey"),
            Self::Key(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
        }
    }
}

/// A half-open range of shard keys `[min, max)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    /// Start of the range (inclusive).
    pub min: KeyBound,
    /// End of the range (exclusive).
    pub max: KeyBound,
}

impl ChunkRange {
    /// Creates a new chunk range.
    ///
    /// # Panics
    ///
    /// Panics if min >= max.
    #[must_use]
    pub fn new(min: KeyBound, max: KeyBound) -> Self {
        assert!(min < max, "chunk range min must be < max");
        Self { min, max }
    }

    /// The range covering the whole key space.
    #[must_use]
    pub const fn full() -> Self {
        Self {
            min: KeyBound::Min,
            max: KeyBound::Max,
        }
    }

    /// Returns true if this range contains the given key.
    #[must_use]
    pub fn contains(&self, key: &KeyBound) -> bool {
        *key >= self.min && *key < self.max
    }

    /// Returns true if the two ranges share at least one key.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// Splits this range at the given point.
    ///
    /// Returns (left, right) where left covers [min, mid) and right covers [mid, max).
    ///
    /// # Panics
    ///
    /// Panics if mid is not strictly within the range.
    #[must_use]
    pub fn split_at(&self, mid: KeyBound) -> (Self, Self) {
        assert!(
            mid > self.min && mid < self.max,
            "split point must be within range"
        );
        (
            Self::new(self.min.clone(), mid.clone()),
            Self::new(mid, self.max.clone()),
        )
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}
