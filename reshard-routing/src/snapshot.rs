//! Routing snapshot - immutable mapping of shard-key ranges to shards.
//!
//! The snapshot defines which shard owns which range of a collection's
//! shard-key space and at which chunk version. It is built once, validated,
//! and never mutated; a catalog refresh produces a new snapshot via
//! [`RoutingSnapshot::apply_refresh`].

use std::collections::{BTreeMap, HashMap};
use std::cmp::Ordering;

use reshard_core::{CollectionId, Epoch, Limits, Namespace, ShardId, ShardKeyPattern};

use crate::error::{RoutingError, RoutingResult};
use crate::key::{ChunkRange, KeyBound};
use crate::version::ChunkVersion;

/// A chunk: a key range, its owner, and its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The key range for this chunk.
    pub range: ChunkRange,
    /// The shard that owns the range.
    pub shard: ShardId,
    /// Version of the chunk.
    pub version: ChunkVersion,
}

impl Chunk {
    /// Creates a chunk.
    #[must_use]
    pub const fn new(range: ChunkRange, shard: ShardId, version: ChunkVersion) -> Self {
        Self {
            range,
            shard,
            version,
        }
    }
}

/// Immutable routing table for one collection.
///
/// Chunks are kept in a `BTreeMap` keyed by range start so `owner_of` is an
/// ordered lookup. Per-shard maximum versions are computed once at
/// construction so `version_for` is a hash lookup.
#[derive(Debug, Clone)]
pub struct RoutingSnapshot {
    namespace: Namespace,
    collection_id: CollectionId,
    shard_key: ShardKeyPattern,
    epoch: Epoch,
    /// Map from range start to chunk.
    chunks: BTreeMap<KeyBound, Chunk>,
    /// Highest version each shard has held in this epoch.
    shard_versions: HashMap<ShardId, ChunkVersion>,
    /// Number of chunks each shard currently owns.
    chunk_counts: HashMap<ShardId, u32>,
    collection_version: ChunkVersion,
}

impl RoutingSnapshot {
    /// Builds a snapshot from a complete chunk list.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunks are empty, too many, belong to another
    /// epoch, overlap, or leave part of `[MinKey, MaxKey)` uncovered.
    pub fn new(
        namespace: Namespace,
        collection_id: CollectionId,
        shard_key: ShardKeyPattern,
        epoch: Epoch,
        chunks: Vec<Chunk>,
    ) -> RoutingResult<Self> {
        Self::build(
            namespace,
            collection_id,
            shard_key,
            epoch,
            chunks,
            HashMap::new(),
        )
    }

    /// Builds a snapshot where one shard owns the whole key space at version 1|0.
    #[must_use]
    pub fn single_shard(
        namespace: Namespace,
        collection_id: CollectionId,
        shard_key: ShardKeyPattern,
        epoch: Epoch,
        shard: ShardId,
    ) -> Self {
        let version = ChunkVersion::new(1, 0, epoch);
        let chunk = Chunk::new(ChunkRange::full(), shard.clone(), version);

        let mut chunks = BTreeMap::new();
        chunks.insert(KeyBound::Min, chunk);
        Self {
            namespace,
            collection_id,
            shard_key,
            epoch,
            chunks,
            shard_versions: HashMap::from([(shard.clone(), version)]),
            chunk_counts: HashMap::from([(shard, 1)]),
            collection_version: version,
        }
    }

    fn build(
        namespace: Namespace,
        collection_id: CollectionId,
        shard_key: ShardKeyPattern,
        epoch: Epoch,
        chunks: Vec<Chunk>,
        carried_versions: HashMap<ShardId, ChunkVersion>,
    ) -> RoutingResult<Self> {
        if chunks.is_empty() {
            return Err(RoutingError::EmptySnapshot { namespace });
        }
        let max_chunks = Limits::new().max_chunks_per_snapshot;
        if chunks.len() > max_chunks as usize {
            return Err(RoutingError::TooManyChunks {
                count: chunks.len(),
                max: max_chunks,
            });
        }

        let mut by_start = BTreeMap::new();
        for chunk in chunks {
            if chunk.version.epoch() != epoch {
                return Err(RoutingError::EpochMismatch {
                    namespace,
                    version: chunk.version,
                });
            }
            let start = chunk.range.min.clone();
            if by_start.insert(start.clone(), chunk).is_some() {
                return Err(RoutingError::OverlappingChunks { at: start });
            }
        }

        // Chunks must tile [MinKey, MaxKey) exactly.
        let mut expected = KeyBound::Min;
        for chunk in by_start.values() {
            match chunk.range.min.cmp(&expected) {
                Ordering::Less => {
                    return Err(RoutingError::OverlappingChunks {
                        at: chunk.range.min.clone(),
                    });
                }
                Ordering::Greater => return Err(RoutingError::GapInChunks { at: expected }),
                Ordering::Equal => {}
            }
            expected = chunk.range.max.clone();
        }
        if expected != KeyBound::Max {
            return Err(RoutingError::GapInChunks { at: expected });
        }

        let mut shard_versions = carried_versions;
        let mut chunk_counts: HashMap<ShardId, u32> = HashMap::new();
        let mut collection_version = ChunkVersion::no_chunks(epoch);
        for chunk in by_start.values() {
            *chunk_counts.entry(chunk.shard.clone()).or_insert(0) += 1;

            let shard_version = shard_versions
                .entry(chunk.shard.clone())
                .or_insert(chunk.version);
            if shard_version.is_older_than(&chunk.version) {
                *shard_version = chunk.version;
            }
            if collection_version.is_older_than(&chunk.version) {
                collection_version = chunk.version;
            }
        }

        Ok(Self {
            namespace,
            collection_id,
            shard_key,
            epoch,
            chunks: by_start,
            shard_versions,
            chunk_counts,
            collection_version,
        })
    }

    /// Returns a new snapshot with `changed` chunks applied.
    ///
    /// Every changed chunk must be newer than the current collection version
    /// in the same epoch. Existing chunks overlapping a changed chunk are
    /// replaced; the result must still tile the key space. A shard that gives
    /// away its last chunk keeps the highest version it held, so
    /// `version_for` never decreases across refreshes.
    ///
    /// # Errors
    ///
    /// Returns `EpochMismatch`, `VersionRegression`, or a coverage error.
    pub fn apply_refresh(&self, changed: Vec<Chunk>) -> RoutingResult<Self> {
        if changed.is_empty() {
            return Ok(self.clone());
        }

        for chunk in &changed {
            if !chunk.version.is_same_epoch(&self.collection_version) {
                return Err(RoutingError::EpochMismatch {
                    namespace: self.namespace.clone(),
                    version: chunk.version,
                });
            }
            if !self.collection_version.is_older_than(&chunk.version) {
                return Err(RoutingError::VersionRegression {
                    namespace: self.namespace.clone(),
                    current: self.collection_version,
                    proposed: chunk.version,
                });
            }
        }

        let mut chunks: Vec<Chunk> = self
            .chunks
            .values()
            .filter(|old| !changed.iter().any(|new| new.range.overlaps(&old.range)))
            .cloned()
            .collect();
        chunks.extend(changed);

        Self::build(
            self.namespace.clone(),
            self.collection_id,
            self.shard_key.clone(),
            self.epoch,
            chunks,
            self.shard_versions.clone(),
        )
    }

    /// Collection this snapshot routes.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Identifier of the collection incarnation.
    #[must_use]
    pub const fn collection_id(&self) -> CollectionId {
        self.collection_id
    }

    /// Shard-key pattern of the collection.
    #[must_use]
    pub const fn shard_key(&self) -> &ShardKeyPattern {
        &self.shard_key
    }

    /// Routing epoch.
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Highest chunk version in the snapshot.
    #[must_use]
    pub const fn collection_version(&self) -> ChunkVersion {
        self.collection_version
    }

    /// Returns the shard version: the highest version the shard has held in
    /// this epoch, or the "no chunks" sentinel.
    #[must_use]
    pub fn version_for(&self, shard: &ShardId) -> ChunkVersion {
        self.shard_versions
            .get(shard)
            .copied()
            .unwrap_or_else(|| ChunkVersion::no_chunks(self.epoch))
    }

    /// Returns true if the shard currently owns at least one chunk.
    #[must_use]
    pub fn owns_chunks(&self, shard: &ShardId) -> bool {
        self.chunk_counts.get(shard).is_some_and(|count| *count > 0)
    }

    /// Returns the chunk containing `key`.
    #[must_use]
    pub fn chunk_for(&self, key: &KeyBound) -> Option<&Chunk> {
        // Find the chunk with the largest start <= key.
        self.chunks
            .range(..=key.clone())
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.range.contains(key))
    }

    /// Returns the shard owning `key`.
    ///
    /// Only `KeyBound::Max` has no owner, since chunks are half-open.
    #[must_use]
    pub fn owner_of(&self, key: &KeyBound) -> Option<&ShardId> {
        self.chunk_for(key).map(|chunk| &chunk.shard)
    }

    /// Number of chunks.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Iterates chunks in key order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> + '_ {
        self.chunks.values()
    }

    /// Ranges currently owned by `shard`, in key order.
    #[must_use]
    pub fn owned_ranges(&self, shard: &ShardId) -> Vec<ChunkRange> {
        self.chunks
            .values()
            .filter(|chunk| chunk.shard == *shard)
            .map(|chunk| chunk.range.clone())
            .collect()
    }

    /// Shards that currently own chunks, sorted.
    #[must_use]
    pub fn shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<_> = self
            .chunk_counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(shard, _)| shard.clone())
            .collect();
        shards.sort();
        shards
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        "db.foo".parse().unwrap()
    }

    fn key() -> ShardKeyPattern {
        ShardKeyPattern::new(["oldKey"]).unwrap()
    }

    fn k(s: &'static str) -> KeyBound {
        KeyBound::key(s)
    }

    fn shard(name: &str) -> ShardId {
        ShardId::new(name)
    }

    /// [Min, m) on A at 1|0, [m, Max) on B at 1|1.
    fn two_shard_snapshot() -> RoutingSnapshot {
        let epoch = Epoch::new(1);
        RoutingSnapshot::new(
            ns(),
            CollectionId::new(10),
            key(),
            epoch,
            vec![
                Chunk::new(
                    ChunkRange::new(KeyBound::Min, k("m")),
                    shard("A"),
                    ChunkVersion::new(1, 0, epoch),
                ),
                Chunk::new(
                    ChunkRange::new(k("m"), KeyBound::Max),
                    shard("B"),
                    ChunkVersion::new(1, 1, epoch),
                ),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_single_shard() {
        let snapshot = RoutingSnapshot::single_shard(
            ns(),
            CollectionId::new(1),
            key(),
            Epoch::new(3),
            shard("shardOne"),
        );

        assert_eq!(snapshot.chunk_count(), 1);
        assert_eq!(snapshot.owner_of(&k("anything")), Some(&shard("shardOne")));
        assert_eq!(
            snapshot.version_for(&shard("shardOne")),
            ChunkVersion::new(1, 0, Epoch::new(3))
        );
        assert!(snapshot.version_for(&shard("shardTwo")).is_no_chunks());
        assert!(!snapshot.owns_chunks(&shard("shardTwo")));
    }

    #[test]
    fn test_owner_of() {
        let snapshot = two_shard_snapshot();

        assert_eq!(snapshot.owner_of(&KeyBound::Min), Some(&shard("A")));
        assert_eq!(snapshot.owner_of(&k("a")), Some(&shard("A")));
        assert_eq!(snapshot.owner_of(&k("m")), Some(&shard("B")));
        assert_eq!(snapshot.owner_of(&k("z")), Some(&shard("B")));
        assert_eq!(snapshot.owner_of(&KeyBound::Max), None);
        assert_eq!(snapshot.shards(), vec![shard("A"), shard("B")]);
    }

    #[test]
    fn test_versions() {
        let snapshot = two_shard_snapshot();
        let epoch = Epoch::new(1);

        assert_eq!(snapshot.version_for(&shard("A")), ChunkVersion::new(1, 0, epoch));
        assert_eq!(snapshot.version_for(&shard("B")), ChunkVersion::new(1, 1, epoch));
        assert_eq!(snapshot.collection_version(), ChunkVersion::new(1, 1, epoch));
    }

    #[test]
    fn test_gap_rejected() {
        let epoch = Epoch::new(1);
        let err = RoutingSnapshot::new(
            ns(),
            CollectionId::new(1),
            key(),
            epoch,
            vec![
                Chunk::new(
                    ChunkRange::new(KeyBound::Min, k("f")),
                    shard("A"),
                    ChunkVersion::new(1, 0, epoch),
                ),
                Chunk::new(
                    ChunkRange::new(k("m"), KeyBound::Max),
                    shard("B"),
                    ChunkVersion::new(1, 1, epoch),
                ),
            ],
        )
        .unwrap_err();

        assert_eq!(err, RoutingError::GapInChunks { at: k("f") });
    }

    #[test]
    fn test_overlap_rejected() {
        let epoch = Epoch::new(1);
        let err = RoutingSnapshot::new(
            ns(),
            CollectionId::new(1),
            key(),
            epoch,
            vec![
                Chunk::new(
                    ChunkRange::new(KeyBound::Min, k("p")),
                    shard("A"),
                    ChunkVersion::new(1, 0, epoch),
                ),
                Chunk::new(
                    ChunkRange::new(k("m"), KeyBound::Max),
                    shard("B"),
                    ChunkVersion::new(1, 1, epoch),
                ),
            ],
        )
        .unwrap_err();

        assert_eq!(err, RoutingError::OverlappingChunks { at: k("m") });
    }

    #[test]
    fn test_missing_max_rejected() {
        let epoch = Epoch::new(1);
        let err = RoutingSnapshot::new(
            ns(),
            CollectionId::new(1),
            key(),
            epoch,
            vec![Chunk::new(
                ChunkRange::new(KeyBound::Min, k("m")),
                shard("A"),
                ChunkVersion::new(1, 0, epoch),
            )],
        )
        .unwrap_err();

        assert_eq!(err, RoutingError::GapInChunks { at: k("m") });
    }

    #[test]
    fn test_empty_and_epoch_mismatch_rejected() {
        let err =
            RoutingSnapshot::new(ns(), CollectionId::new(1), key(), Epoch::new(1), vec![])
                .unwrap_err();
        assert!(matches!(err, RoutingError::EmptySnapshot { .. }));

        let err = RoutingSnapshot::new(
            ns(),
            CollectionId::new(1),
            key(),
            Epoch::new(1),
            vec![Chunk::new(
                ChunkRange::full(),
                shard("A"),
                ChunkVersion::new(1, 0, Epoch::new(2)),
            )],
        )
        .unwrap_err();
        assert!(matches!(err, RoutingError::EpochMismatch { .. }));
    }

    #[test]
    fn test_refresh_moves_chunk_and_versions_never_decrease() {
        let snapshot = two_shard_snapshot();
        let epoch = Epoch::new(1);
        let a_before = snapshot.version_for(&shard("A"));
        let b_before = snapshot.version_for(&shard("B"));

        // Migrate A's only chunk to B.
        let refreshed = snapshot
            .apply_refresh(vec![Chunk::new(
                ChunkRange::new(KeyBound::Min, k("m")),
                shard("B"),
                ChunkVersion::new(2, 0, epoch),
            )])
            .unwrap();

        assert_eq!(refreshed.owner_of(&k("a")), Some(&shard("B")));
        assert!(!refreshed.owns_chunks(&shard("A")));
        assert!(!refreshed.version_for(&shard("A")).is_older_than(&a_before));
        assert!(b_before.is_older_than(&refreshed.version_for(&shard("B"))));

        // The original snapshot is untouched.
        assert_eq!(snapshot.owner_of(&k("a")), Some(&shard("A")));
    }

    #[test]
    fn test_refresh_split() {
        let snapshot = two_shard_snapshot();
        let epoch = Epoch::new(1);
        let (left, right) = ChunkRange::new(k("m"), KeyBound::Max).split_at(k("t"));

        let refreshed = snapshot
            .apply_refresh(vec![
                Chunk::new(left, shard("B"), ChunkVersion::new(1, 2, epoch)),
                Chunk::new(right, shard("C"), ChunkVersion::new(2, 0, epoch)),
            ])
            .unwrap();

        assert_eq!(refreshed.chunk_count(), 3);
        assert_eq!(refreshed.owner_of(&k("p")), Some(&shard("B")));
        assert_eq!(refreshed.owner_of(&k("x")), Some(&shard("C")));
        assert_eq!(refreshed.owned_ranges(&shard("B")).len(), 1);
    }

    #[test]
    fn test_refresh_regression_rejected() {
        let snapshot = two_shard_snapshot();
        let err = snapshot
            .apply_refresh(vec![Chunk::new(
                ChunkRange::new(KeyBound::Min, k("m")),
                shard("B"),
                ChunkVersion::new(1, 1, Epoch::new(1)),
            )])
            .unwrap_err();

        assert!(matches!(err, RoutingError::VersionRegression { .. }));
    }

    #[test]
    fn test_refresh_partial_cover_rejected() {
        let snapshot = two_shard_snapshot();
        // Replaces [m, Max) but only re-covers [m, t).
        let err = snapshot
            .apply_refresh(vec![Chunk::new(
                ChunkRange::new(k("m"), k("t")),
                shard("B"),
                ChunkVersion::new(1, 2, Epoch::new(1)),
            )])
            .unwrap_err();

        assert_eq!(err, RoutingError::GapInChunks { at: k("t") });
    }
}
