// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Seams to the organizer's collaborators.
//!
//! The organizer never owns buffers, metadata, targets, locks, or the
//! transport; it borrows them through the traits here. [`BoContext`] bundles
//! one view of each into a single handle, constructed once at daemon init.
//! Everything reachable from the handle must be callable from any worker
//! task, hence the `Send + Sync` bounds throughout.
//!
//! Local store operations are synchronous (they resolve against node-local
//! state); only the lock manager and the transport may cross the wire and
//! are async.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::pool::PoolError;
use crate::types::{
    BlobId, BoPriority, BoTask, BucketId, BufferHeader, BufferId, NodeId, PlacementContext,
    PlacementSchema, SwapBlob, TargetId, VBucketId,
};

/// Read/write view of the node-local buffer pool and its headers.
pub trait BufferStore: Send + Sync {
    /// Snapshot the header of a buffer, or `None` when the id does not
    /// resolve on this node.
    fn header(&self, id: BufferId) -> Option<BufferHeader>;

    /// Published bandwidth of the device backing `header`.
    fn device_bandwidth_mbps(&self, header: &BufferHeader) -> f32;

    /// Read the buffer's bytes from `offset` through its `used` mark.
    fn read(&self, id: BufferId, offset: u64) -> Result<Bytes>;

    /// Write `data` into the buffer starting at `offset`, updating its
    /// `used` mark. Thread-safe per buffer.
    fn write(&self, id: BufferId, data: &[u8], offset: u64) -> Result<()>;

    /// Return a buffer to its target's free list.
    fn release(&self, id: BufferId);

    /// Allocate buffers realizing `schema`. An empty result means the
    /// allocator could not satisfy the schema.
    fn get_buffers(&self, schema: &PlacementSchema) -> Vec<BufferId>;
}

/// View of the distributed metadata plane, resolved on this node.
pub trait MetadataManager: Send + Sync {
    /// Resolve an internal blob name to its id.
    fn blob_id(&self, internal_name: &str) -> Option<BlobId>;

    /// The blob's ordered buffer-id list.
    fn buffer_id_list(&self, blob_id: BlobId) -> Vec<BufferId>;

    /// Policy-assigned importance score for the blob, in [0, 1].
    fn blob_importance_score(&self, blob_id: BlobId) -> f32;

    /// Compose the internal name that keys a blob within its bucket.
    fn make_internal_blob_name(&self, name: &str, bucket_id: BucketId) -> String;

    /// Hash a name to the node that owns its metadata.
    fn hash_to_node(&self, name: &str) -> NodeId;

    /// Atomically rewrite the blob's buffer list, substituting `src` with
    /// `replacements`, and update the blob map and the bucket's blob list.
    /// Returns the blob's new id. Readers of the blob observe either the old
    /// or the new list, never a mix.
    ///
    /// `blob_id` may be any id the blob has carried during reorganization:
    /// moves queued against one pass all reference the id the pass saw, and
    /// the metadata plane resolves it to the current record.
    fn replace_buffer_ids(
        &self,
        blob_id: BlobId,
        src: BufferId,
        replacements: &[BufferId],
    ) -> Result<BlobId>;

    /// Buffers currently placed on `target`, with the blobs referencing
    /// them. Supports the capacity-violation sweep.
    fn buffers_on_target(&self, target: TargetId) -> Vec<(BufferId, BlobId)>;

    /// Drop one blob reference to `id`. Returns the referencing blob when
    /// this was its last buffer (the metadata plane marks it deletable).
    fn drop_buffer_reference(&self, id: BufferId) -> Option<BlobId>;

    /// Resolve a virtual-bucket name.
    fn vbucket_id(&self, name: &str) -> Option<VBucketId>;

    /// Materialize the blob's full contents, in buffer-list order.
    fn blob_bytes(&self, blob_id: BlobId) -> Result<Bytes>;
}

/// The data placement engine: computes placement schemas for new data and
/// re-inserts blobs the organizer rematerializes from swap.
pub trait PlacementEngine: Send + Sync {
    /// Compute one schema per requested size.
    fn calculate_placement(
        &self,
        sizes: &[u64],
        ctx: &PlacementContext,
    ) -> Result<Vec<PlacementSchema>>;

    /// Realize `schema` for `data` and register the result as a blob under
    /// `name` in `bucket_id`.
    fn place_blob(
        &self,
        schema: &PlacementSchema,
        data: &[u8],
        name: &str,
        bucket_id: BucketId,
    ) -> Result<BlobId>;
}

/// View of the node's targets and their live capacity.
pub trait TargetStore: Send + Sync {
    fn node_targets(&self) -> Vec<TargetId>;

    fn bandwidths(&self, targets: &[TargetId]) -> Vec<f32>;

    fn remaining_capacities(&self, targets: &[TargetId]) -> Vec<u64>;
}

/// Per-blob lock arbitration. The distributed variants route to the blob's
/// home node; the local variants touch only node-local state.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire the blob's lock, arbitrated by its home node. Returns `false`
    /// on contention.
    async fn lock_blob(&self, blob_id: BlobId) -> bool;

    async fn unlock_blob(&self, blob_id: BlobId);

    fn local_lock_blob(&self, blob_id: BlobId) -> bool;

    fn local_unlock_blob(&self, blob_id: BlobId);
}

/// Read side of the swap file.
pub trait SwapStore: Send + Sync {
    fn read(&self, swap_blob: &SwapBlob) -> Result<Bytes>;

    fn delete(&self, swap_blob: &SwapBlob) -> Result<()>;
}

/// Typed request/response transport between nodes.
///
/// Implementations own the engine selection: names carrying the organizer
/// prefix (see [`crate::rpc::is_bo_function`]) are routed to the remote
/// node's dedicated organizer engine with the prefix stripped; everything
/// else goes to the main engine.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Request/response call.
    async fn call(&self, node_id: NodeId, func: &str, args: Bytes) -> Result<Bytes>;

    /// One-way call; no response is awaited.
    async fn notify(&self, node_id: NodeId, func: &str, args: Bytes) -> Result<()>;
}

/// Narrow capability for enqueueing organizer work.
///
/// The metadata plane holds one of these instead of a reference to the
/// organizer itself, which keeps the metadata manager free of a module
/// cycle with this crate.
pub trait TaskSink: Send + Sync {
    fn submit(&self, task: BoTask, priority: BoPriority) -> Result<(), PoolError>;
}

/// Handle bundling the organizer's view of every collaborator.
#[derive(Clone)]
pub struct BoContext {
    pub buffers: Arc<dyn BufferStore>,
    pub metadata: Arc<dyn MetadataManager>,
    pub placement: Arc<dyn PlacementEngine>,
    pub targets: Arc<dyn TargetStore>,
    pub locks: Arc<dyn LockManager>,
    pub swap: Arc<dyn SwapStore>,
    pub rpc: Arc<dyn RpcClient>,
    pub node_id: NodeId,
}

impl BoContext {
    pub fn builder() -> BoContextBuilder {
        BoContextBuilder::default()
    }
}

/// Builder for [`BoContext`].
#[derive(Default)]
pub struct BoContextBuilder {
    buffers: Option<Arc<dyn BufferStore>>,
    metadata: Option<Arc<dyn MetadataManager>>,
    placement: Option<Arc<dyn PlacementEngine>>,
    targets: Option<Arc<dyn TargetStore>>,
    locks: Option<Arc<dyn LockManager>>,
    swap: Option<Arc<dyn SwapStore>>,
    rpc: Option<Arc<dyn RpcClient>>,
    node_id: Option<NodeId>,
}

impl BoContextBuilder {
    pub fn buffers(mut self, buffers: Arc<dyn BufferStore>) -> Self {
        self.buffers = Some(buffers);
        self
    }

    pub fn metadata(mut self, metadata: Arc<dyn MetadataManager>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn placement(mut self, placement: Arc<dyn PlacementEngine>) -> Self {
        self.placement = Some(placement);
        self
    }

    pub fn targets(mut self, targets: Arc<dyn TargetStore>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn swap(mut self, swap: Arc<dyn SwapStore>) -> Self {
        self.swap = Some(swap);
        self
    }

    pub fn rpc(mut self, rpc: Arc<dyn RpcClient>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    pub fn node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn build(self) -> Result<BoContext> {
        Ok(BoContext {
            buffers: self
                .buffers
                .ok_or_else(|| anyhow::anyhow!("buffer store required"))?,
            metadata: self
                .metadata
                .ok_or_else(|| anyhow::anyhow!("metadata manager required"))?,
            placement: self
                .placement
                .ok_or_else(|| anyhow::anyhow!("placement engine required"))?,
            targets: self
                .targets
                .ok_or_else(|| anyhow::anyhow!("target store required"))?,
            locks: self
                .locks
                .ok_or_else(|| anyhow::anyhow!("lock manager required"))?,
            swap: self
                .swap
                .ok_or_else(|| anyhow::anyhow!("swap store required"))?,
            rpc: self.rpc.ok_or_else(|| anyhow::anyhow!("rpc client required"))?,
            node_id: self
                .node_id
                .ok_or_else(|| anyhow::anyhow!("node id required"))?,
        })
    }
}
