// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Core data types for the buffer organizer.
//!
//! Identifiers are 64-bit tagged values: the high 32 bits carry the owning
//! node, the low 32 bits an index meaningful to that node (buffer header
//! slot, buffer-id-list offset, target slot). They travel over the wire as
//! plain `u64`s, so the packing here is part of the cross-node contract.

use std::fmt;

/// Identifier of a node in the cluster. Node ids are 1-based; 0 is reserved
/// and never names a valid owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! packed_id {
    ($(#[$doc:meta])* $name:ident, $index_name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(u64);

        impl $name {
            pub fn new(node_id: NodeId, $index_name: u32) -> Self {
                Self(((node_id.0 as u64) << 32) | $index_name as u64)
            }

            /// Node that owns this id.
            pub fn node_id(&self) -> NodeId {
                NodeId((self.0 >> 32) as u32)
            }

            pub fn $index_name(&self) -> u32 {
                self.0 as u32
            }

            /// The 64-bit wire representation.
            pub fn as_u64(&self) -> u64 {
                self.0
            }

            pub fn from_u64(raw: u64) -> Self {
                Self(raw)
            }

            /// The all-zero id, used as a "not found" sentinel by the
            /// metadata plane.
            pub fn null() -> Self {
                Self(0)
            }

            pub fn is_null(&self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

packed_id!(
    /// A fixed-capacity storage fragment on a single target.
    BufferId,
    header_index
);

packed_id!(
    /// A user-visible bucket of blobs.
    BucketId,
    index
);

packed_id!(
    /// A virtual bucket; scopes outstanding flushes by backing filename.
    VBucketId,
    index
);

packed_id!(
    /// A logical storage device with a published bandwidth and a remaining
    /// capacity.
    TargetId,
    index
);

/// Bit 63 of a blob id marks a blob that lives in the swap file rather than
/// the buffer hierarchy. The flag overlaps the top bit of the node field, so
/// `node_id()` masks it out.
const BLOB_SWAP_FLAG: u64 = 1 << 63;

/// A user-addressable byte object stored as an ordered sequence of buffers.
///
/// The low 32 bits locate the blob's buffer-id list on the owning node; a
/// reorganization that rewrites the list produces a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(u64);

impl BlobId {
    pub fn new(node_id: NodeId, buffer_ids_offset: u32) -> Self {
        Self(((node_id.0 as u64) << 32) | buffer_ids_offset as u64)
    }

    pub fn node_id(&self) -> NodeId {
        NodeId(((self.0 & !BLOB_SWAP_FLAG) >> 32) as u32)
    }

    pub fn buffer_ids_offset(&self) -> u32 {
        self.0 as u32
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub fn null() -> Self {
        Self(0)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Whether this blob has been evicted to swap.
    pub fn is_in_swap(&self) -> bool {
        self.0 & BLOB_SWAP_FLAG != 0
    }

    /// The same id with the swap flag set.
    pub fn to_swap(&self) -> Self {
        Self(self.0 | BLOB_SWAP_FLAG)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a buffer slot's bookkeeping, read through the buffer store.
///
/// `capacity` is fixed for the slot's lifetime; `used` is how many bytes the
/// current occupant actually holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHeader {
    pub capacity: u64,
    pub used: u64,
    pub target: TargetId,
}

/// Per-buffer view used by the scoring functions: identity, the bandwidth of
/// the device the buffer sits on, and the bytes it holds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferInfo {
    pub id: BufferId,
    pub bandwidth_mbps: f32,
    pub size: u64,
}

/// Per-target view used by the reorganizer when picking migration
/// destinations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetInfo {
    pub id: TargetId,
    pub bandwidth_mbps: f32,
    pub capacity: u64,
}

/// An ordered plan of `(bytes, target)` pairs; consumed by the buffer
/// allocator to realize destination buffers.
pub type PlacementSchema = Vec<(u64, TargetId)>;

/// Descriptor of a blob evicted from the hierarchy into the swap file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapBlob {
    pub node_id: u32,
    pub offset: u64,
    pub size: u64,
    pub bucket_id: BucketId,
}

/// Scheduling class for organizer tasks. High-priority tasks preempt
/// low-priority tasks for dequeue; fairness within a class is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoPriority {
    Low = 0,
    High = 1,
}

/// Discriminant of a [`BoTask`]; wire-visible as a 32-bit integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoOperation {
    Move = 0,
    Copy = 1,
    Delete = 2,
}

/// A unit of organizer work, executed by the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub enum BoTask {
    /// Migrate one source buffer into one or more pre-allocated destination
    /// buffers, then rewrite the blob's buffer list.
    Move {
        src: BufferId,
        destinations: Vec<BufferId>,
        blob_id: BlobId,
    },
    /// Duplicate a buffer's contents into a fresh buffer on the destination
    /// target.
    Copy { src: BufferId, dest: TargetId },
    /// Release a buffer back to its target's free list.
    Delete { src: BufferId },
}

impl BoTask {
    pub fn op(&self) -> BoOperation {
        match self {
            BoTask::Move { .. } => BoOperation::Move,
            BoTask::Copy { .. } => BoOperation::Copy,
            BoTask::Delete { .. } => BoOperation::Delete,
        }
    }
}

/// Which side of a capacity threshold a target has crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdViolation {
    Min = 0,
    Max = 1,
}

/// A capacity-threshold crossing reported by the capacity monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationInfo {
    pub target_id: TargetId,
    pub violation: ThresholdViolation,
    pub violation_size: u64,
}

/// Key space selector for metadata lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    BucketId = 0,
    VBucketId = 1,
    BlobId = 2,
}

/// Placement strategy requested from the data placement engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementPolicy {
    Random = 0,
    RoundRobin = 1,
    MinimizeIoTime = 2,
}

/// Per-request placement knobs, forwarded to the placement engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementContext {
    pub buffer_organizer_retries: u8,
    pub policy: PlacementPolicy,
}

impl Default for PlacementContext {
    fn default() -> Self {
        Self {
            buffer_organizer_retries: 3,
            policy: PlacementPolicy::MinimizeIoTime,
        }
    }
}

/// Prefetcher guidance attached to placement requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchHint {
    None = 0,
    FileSequential = 1,
    Apriori = 2,
    FileStrided = 3,
    MachineLearning = 4,
}

/// Prefetch settings carried alongside a placement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchContext {
    pub hint: PrefetchHint,
    pub read_ahead: i32,
}

impl Default for PrefetchContext {
    fn default() -> Self {
        Self {
            hint: PrefetchHint::None,
            read_ahead: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_id_packing() {
        let id = BufferId::new(NodeId(3), 0xdead_beef);
        assert_eq!(id.node_id(), NodeId(3));
        assert_eq!(id.header_index(), 0xdead_beef);
        assert_eq!(BufferId::from_u64(id.as_u64()), id);
    }

    #[test]
    fn test_blob_id_swap_flag() {
        let id = BlobId::new(NodeId(7), 42);
        assert!(!id.is_in_swap());

        let swapped = id.to_swap();
        assert!(swapped.is_in_swap());
        // The swap flag must not leak into the node field.
        assert_eq!(swapped.node_id(), NodeId(7));
        assert_eq!(swapped.buffer_ids_offset(), 42);
    }

    #[test]
    fn test_null_ids() {
        assert!(BufferId::null().is_null());
        assert!(BlobId::null().is_null());
        assert!(!BufferId::new(NodeId(1), 0).is_null());
    }

    #[test]
    fn test_task_op_discriminants() {
        let task = BoTask::Delete {
            src: BufferId::new(NodeId(1), 9),
        };
        assert_eq!(task.op(), BoOperation::Delete);
        assert_eq!(BoOperation::Delete as i32, 2);
    }
}
