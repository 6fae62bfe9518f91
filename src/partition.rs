//------------ Partitions ----------------------------------------------------
//
// When rules distinguish pipeline stages by exact metadata values, the
// classifier keeps one partition per metadata value seen in any rule
// whose subtable pins the whole metadata field. A partition aggregates
// the tags of every such subtable holding at least one rule with that
// value, so a lookup can skip any full-metadata subtable whose tag is
// not in the aggregate. Subtables that do not pin all of metadata get
// `TAG_ALL` and are never skipped this way.
//
// The aggregate may contain stale tags between a writer's update steps
// in the sense that two subtables can hash to overlapping tag bits;
// that only costs a wasted probe, never a missed rule.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_epoch::Guard;
use log::debug;

use crate::cmap::Cmap;
use crate::types::flow::hash_metadata;

/// The tag carried by subtables that must be visited for every metadata
/// value.
pub const TAG_ALL: u64 = !0u64;

/// A single nonzero tag, used as the aggregate for metadata values that
/// have no partition: it intersects `TAG_ALL` (so unpartitioned
/// subtables are still visited) and nothing else.
pub(crate) const TAG_ARBITRARY: u64 = 1u64 << 63;

/// Two bits derived from a hash. Distinct subtables most likely get
/// distinct tags; a collision costs performance, not correctness.
pub(crate) fn tag_create_deterministic(hash: u64) -> u64 {
    (1u64 << (hash & 63)) | (1u64 << ((hash >> 6) & 63))
}

pub(crate) struct Partition {
    metadata: u64,
    tags: AtomicU64,
}

impl Clone for Partition {
    fn clone(&self) -> Self {
        Partition {
            metadata: self.metadata,
            tags: AtomicU64::new(self.tags.load(Ordering::Relaxed)),
        }
    }
}

pub(crate) struct PartitionMap {
    map: Cmap<Partition>,
}

impl PartitionMap {
    pub(crate) fn new() -> Self {
        PartitionMap { map: Cmap::new() }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The tag aggregate for a metadata value, or `None` if no rule
    /// matches it exactly.
    pub(crate) fn lookup_tags(
        &self,
        metadata: u64,
        guard: &Guard,
    ) -> Option<u64> {
        self.map
            .find(hash_metadata(metadata), guard, |p| {
                p.metadata == metadata
            })
            .map(|p| p.tags.load(Ordering::Acquire))
    }

    /// Writer only. Publish a freshly recomputed aggregate for
    /// `metadata`, creating or destroying the partition as needed.
    pub(crate) fn set_tags(&self, metadata: u64, tags: u64, guard: &Guard) {
        let hash = hash_metadata(metadata);
        if tags == 0 {
            if self.map.remove(hash, guard, |p| p.metadata == metadata) {
                debug!("partition {:#x} destroyed", metadata);
            }
            return;
        }
        match self.map.find(hash, guard, |p| p.metadata == metadata) {
            Some(p) => p.tags.store(tags, Ordering::Release),
            None => {
                debug!("partition {:#x} created", metadata);
                self.map.insert(
                    hash,
                    Partition {
                        metadata,
                        tags: AtomicU64::new(tags),
                    },
                    guard,
                );
            }
        }
    }
}
