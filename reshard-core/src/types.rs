//! Strongly-typed identifiers for resharding entities.
//!
//! Following `TigerStyle`: explicit types prevent bugs from mixing up IDs.
//! Numeric IDs are 64-bit; shards are identified by name.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `OperationId` with `CollectionId`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

// Resharding operations and the collections they touch.
define_id!(OperationId, "op", "Globally unique identifier for one resharding operation.");
define_id!(CollectionId, "coll", "Unique identifier of a collection incarnation.");
define_id!(Epoch, "epoch", "Routing epoch; changes whenever a collection's chunk layout is recreated.");

// Leadership.
define_id!(TermId, "term", "Leadership term of the local replica set.");

/// Name of a shard in the cluster.
///
/// Shards are named by the catalog (e.g. `shard0`), so unlike the numeric
/// identifiers above this wraps a string.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(String);

impl ShardId {
    /// Creates a shard ID from its name.
    ///
    /// # Panics
    /// Panics if the name is empty.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.is_empty(), "shard name must not be empty");
        Self(name)
    }

    /// Returns the shard name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard({})", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Cluster logical time: seconds plus an increment within the second.
///
/// Timestamps are totally ordered by `(secs, inc)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    secs: u32,
    inc: u32,
}

impl Timestamp {
    /// The null timestamp. Never a valid fetch point.
    pub const NULL: Self = Self { secs: 0, inc: 0 };

    /// Creates a timestamp.
    #[must_use]
    pub const fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    /// Seconds component.
    #[must_use]
    pub const fn secs(self) -> u32 {
        self.secs
    }

    /// Increment component.
    #[must_use]
    pub const fn inc(self) -> u32 {
        self.inc
    }

    /// Returns true for the null timestamp.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.secs == 0 && self.inc == 0
    }

    /// Packs the timestamp into a single u64 (secs in the high half).
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        ((self.secs as u64) << 32) | self.inc as u64
    }

    /// Unpacks a timestamp produced by [`Timestamp::as_u64`].
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_u64(value: u64) -> Self {
        Self {
            secs: (value >> 32) as u32,
            inc: value as u32,
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        let op = OperationId::new(42);
        assert_eq!(format!("{op}"), "op-42");
        assert_eq!(format!("{op:?}"), "op(42)");
    }

    #[test]
    fn test_id_next() {
        let id = TermId::new(0);
        assert_eq!(id.next().get(), 1);
        assert_eq!(id.next().next().get(), 2);
    }

    #[test]
    #[should_panic(expected = "ID overflow")]
    fn test_id_overflow_panics() {
        let id = Epoch::new(u64::MAX);
        let _ = id.next();
    }

    #[test]
    fn test_shard_id_ordering() {
        let a = ShardId::new("shardOne");
        let b = ShardId::new("shardTwo");
        assert!(a < b);
        assert_eq!(a.to_string(), "shardOne");
    }

    #[test]
    #[should_panic(expected = "must not be empty")]
    fn test_empty_shard_name_panics() {
        let _ = ShardId::new("");
    }

    #[test]
    fn test_timestamp_ordering() {
        let a = Timestamp::new(1, 0);
        let b = Timestamp::new(1, 5);
        let c = Timestamp::new(2, 0);

        assert!(a < b);
        assert!(b < c);
        assert!(Timestamp::NULL.is_null());
        assert!(!a.is_null());
    }

    #[test]
    fn test_timestamp_packing() {
        let ts = Timestamp::new(1_700_000_000, 17);
        assert_eq!(Timestamp::from_u64(ts.as_u64()), ts);
        // Packed order matches logical order.
        assert!(Timestamp::new(1, 9).as_u64() < Timestamp::new(2, 0).as_u64());
    }
}
