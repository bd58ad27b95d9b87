// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory collaborator fixtures for organizer tests.
//!
//! [`TestCluster`] stands in for a single-node deployment: an in-memory
//! buffer pool with per-target capacity accounting, a metadata map, a local
//! lock table, a greedy placement engine, and a swap store. All collaborator
//! traits are implemented by one [`TestPlatform`] so a [`BoContext`] can be
//! assembled from clones of a single `Arc`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use strata_bo_config::BoConfig;

use crate::organizer::BufferOrganizer;
use crate::services::{
    BoContext, BufferStore, LockManager, MetadataManager, PlacementEngine, RpcClient, SwapStore,
    TargetStore,
};
use crate::types::{
    BlobId, BucketId, BufferHeader, BufferId, NodeId, PlacementContext, PlacementSchema, SwapBlob,
    TargetId, VBucketId,
};

const TEST_NODE: NodeId = NodeId(1);

struct TargetSlot {
    id: TargetId,
    bandwidth_mbps: f32,
    capacity_remaining: AtomicU64,
}

struct TestBuffer {
    capacity: u64,
    used: u64,
    data: Vec<u8>,
    target: TargetId,
}

#[derive(Clone)]
struct BlobRecord {
    internal_name: String,
    bucket_id: BucketId,
    buffers: Vec<BufferId>,
}

#[derive(Default)]
struct MetadataState {
    blobs: HashMap<u64, BlobRecord>,
    names: HashMap<String, BlobId>,
    importance: HashMap<String, f32>,
    vbuckets: HashMap<String, VBucketId>,
    /// Reorganization lineage: superseded blob id -> successor id.
    aliases: HashMap<u64, u64>,
    next_blob_offset: u32,
    next_vbucket_index: u32,
}

impl MetadataState {
    /// Follow the alias chain to the blob's current id.
    fn resolve(&self, raw: u64) -> u64 {
        let mut current = raw;
        while let Some(&next) = self.aliases.get(&current) {
            current = next;
        }
        current
    }
}

/// One object implementing every collaborator seam against in-memory state.
pub struct TestPlatform {
    targets: Vec<TargetSlot>,
    buffers: Mutex<HashMap<u64, TestBuffer>>,
    next_header_index: AtomicU32,
    metadata: Mutex<MetadataState>,
    blob_locks: Mutex<std::collections::HashSet<u64>>,
    swap: Mutex<HashMap<u64, Vec<u8>>>,
}

impl TestPlatform {
    fn new(targets: &[(f32, u64)]) -> Self {
        let targets = targets
            .iter()
            .enumerate()
            .map(|(index, &(bandwidth_mbps, capacity))| TargetSlot {
                id: TargetId::new(TEST_NODE, index as u32),
                bandwidth_mbps,
                capacity_remaining: AtomicU64::new(capacity),
            })
            .collect();

        Self {
            targets,
            buffers: Mutex::new(HashMap::new()),
            next_header_index: AtomicU32::new(1),
            metadata: Mutex::new(MetadataState::default()),
            blob_locks: Mutex::new(std::collections::HashSet::new()),
            swap: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, target: TargetId) -> Option<&TargetSlot> {
        self.targets.iter().find(|slot| slot.id == target)
    }

    /// Reserve capacity and create one buffer on `target`.
    fn allocate(&self, target: TargetId, capacity: u64) -> Option<BufferId> {
        let slot = self.slot(target)?;

        // Compare-and-swap loop so concurrent allocations never oversubscribe.
        loop {
            let available = slot.capacity_remaining.load(Ordering::Acquire);
            if available < capacity {
                return None;
            }
            if slot
                .capacity_remaining
                .compare_exchange(
                    available,
                    available - capacity,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }

        let id = BufferId::new(TEST_NODE, self.next_header_index.fetch_add(1, Ordering::Relaxed));
        self.buffers.lock().insert(
            id.as_u64(),
            TestBuffer {
                capacity,
                used: 0,
                data: Vec::new(),
                target,
            },
        );
        Some(id)
    }

    fn register_blob(
        &self,
        internal_name: &str,
        bucket_id: BucketId,
        buffers: Vec<BufferId>,
    ) -> BlobId {
        let mut meta = self.metadata.lock();
        meta.next_blob_offset += 1;
        let blob_id = BlobId::new(TEST_NODE, meta.next_blob_offset);
        meta.blobs.insert(
            blob_id.as_u64(),
            BlobRecord {
                internal_name: internal_name.to_string(),
                bucket_id,
                buffers,
            },
        );
        meta.names.insert(internal_name.to_string(), blob_id);
        meta.importance.entry(internal_name.to_string()).or_insert(0.5);
        blob_id
    }
}

impl BufferStore for TestPlatform {
    fn header(&self, id: BufferId) -> Option<BufferHeader> {
        let buffers = self.buffers.lock();
        let buffer = buffers.get(&id.as_u64())?;
        Some(BufferHeader {
            capacity: buffer.capacity,
            used: buffer.used,
            target: buffer.target,
        })
    }

    fn device_bandwidth_mbps(&self, header: &BufferHeader) -> f32 {
        self.slot(header.target)
            .map(|slot| slot.bandwidth_mbps)
            .unwrap_or(0.0)
    }

    fn read(&self, id: BufferId, offset: u64) -> Result<Bytes> {
        let buffers = self.buffers.lock();
        let buffer = buffers
            .get(&id.as_u64())
            .with_context(|| format!("buffer {id} not allocated"))?;
        let used = buffer.used as usize;
        let offset = offset as usize;
        if offset > used {
            bail!("read offset {offset} past used mark {used}");
        }
        Ok(Bytes::copy_from_slice(&buffer.data[offset..used]))
    }

    fn write(&self, id: BufferId, data: &[u8], offset: u64) -> Result<()> {
        let mut buffers = self.buffers.lock();
        let buffer = buffers
            .get_mut(&id.as_u64())
            .with_context(|| format!("buffer {id} not allocated"))?;
        let end = offset + data.len() as u64;
        if end > buffer.capacity {
            bail!("write of {} bytes at {offset} exceeds capacity {}", data.len(), buffer.capacity);
        }
        if buffer.data.len() < end as usize {
            buffer.data.resize(end as usize, 0);
        }
        buffer.data[offset as usize..end as usize].copy_from_slice(data);
        buffer.used = buffer.used.max(end);
        Ok(())
    }

    fn release(&self, id: BufferId) {
        if let Some(buffer) = self.buffers.lock().remove(&id.as_u64()) {
            if let Some(slot) = self.slot(buffer.target) {
                slot.capacity_remaining
                    .fetch_add(buffer.capacity, Ordering::AcqRel);
            }
        }
    }

    fn get_buffers(&self, schema: &PlacementSchema) -> Vec<BufferId> {
        let mut allocated = Vec::with_capacity(schema.len());
        for &(size, target) in schema {
            match self.allocate(target, size) {
                Some(id) => allocated.push(id),
                None => {
                    for id in allocated {
                        self.release(id);
                    }
                    return Vec::new();
                }
            }
        }
        allocated
    }
}

impl MetadataManager for TestPlatform {
    fn blob_id(&self, internal_name: &str) -> Option<BlobId> {
        self.metadata.lock().names.get(internal_name).copied()
    }

    fn buffer_id_list(&self, blob_id: BlobId) -> Vec<BufferId> {
        let meta = self.metadata.lock();
        let current = meta.resolve(blob_id.as_u64());
        meta.blobs
            .get(&current)
            .map(|record| record.buffers.clone())
            .unwrap_or_default()
    }

    fn blob_importance_score(&self, blob_id: BlobId) -> f32 {
        let meta = self.metadata.lock();
        let current = meta.resolve(blob_id.as_u64());
        meta.blobs
            .get(&current)
            .and_then(|record| meta.importance.get(&record.internal_name))
            .copied()
            .unwrap_or(0.0)
    }

    fn make_internal_blob_name(&self, name: &str, bucket_id: BucketId) -> String {
        format!("{}|{name}", bucket_id.as_u64())
    }

    fn hash_to_node(&self, _name: &str) -> NodeId {
        TEST_NODE
    }

    fn replace_buffer_ids(
        &self,
        blob_id: BlobId,
        src: BufferId,
        replacements: &[BufferId],
    ) -> Result<BlobId> {
        let mut meta = self.metadata.lock();
        let current = meta.resolve(blob_id.as_u64());
        let mut record = meta
            .blobs
            .get(&current)
            .cloned()
            .with_context(|| format!("blob {blob_id} not found"))?;

        let position = record
            .buffers
            .iter()
            .position(|&id| id == src)
            .with_context(|| format!("buffer {src} not in blob {blob_id}"))?;
        record
            .buffers
            .splice(position..=position, replacements.iter().copied());

        meta.blobs.remove(&current);
        meta.next_blob_offset += 1;
        let new_blob_id = BlobId::new(TEST_NODE, meta.next_blob_offset);
        meta.names
            .insert(record.internal_name.clone(), new_blob_id);
        meta.blobs.insert(new_blob_id.as_u64(), record);
        meta.aliases.insert(current, new_blob_id.as_u64());
        Ok(new_blob_id)
    }

    fn buffers_on_target(&self, target: TargetId) -> Vec<(BufferId, BlobId)> {
        let meta = self.metadata.lock();
        let buffers = self.buffers.lock();
        let mut result = Vec::new();
        for (&raw, record) in &meta.blobs {
            for &buffer_id in &record.buffers {
                if let Some(buffer) = buffers.get(&buffer_id.as_u64()) {
                    if buffer.target == target {
                        result.push((buffer_id, BlobId::from_u64(raw)));
                    }
                }
            }
        }
        result
    }

    fn drop_buffer_reference(&self, id: BufferId) -> Option<BlobId> {
        let mut meta = self.metadata.lock();
        let raw = meta
            .blobs
            .iter()
            .find(|(_, record)| record.buffers.contains(&id))
            .map(|(&raw, _)| raw)?;

        let record = meta.blobs.get_mut(&raw).expect("record exists");
        record.buffers.retain(|&buffer| buffer != id);
        if record.buffers.is_empty() {
            let record = meta.blobs.remove(&raw).expect("record exists");
            meta.names.remove(&record.internal_name);
            return Some(BlobId::from_u64(raw));
        }
        None
    }

    fn vbucket_id(&self, name: &str) -> Option<VBucketId> {
        let mut meta = self.metadata.lock();
        meta.next_vbucket_index += 1;
        let next = meta.next_vbucket_index;
        Some(
            *meta
                .vbuckets
                .entry(name.to_string())
                .or_insert_with(|| VBucketId::new(TEST_NODE, next)),
        )
    }

    fn blob_bytes(&self, blob_id: BlobId) -> Result<Bytes> {
        let list = self.buffer_id_list(blob_id);
        if list.is_empty() {
            bail!("blob {blob_id} has no buffers");
        }
        let buffers = self.buffers.lock();
        let mut bytes = Vec::new();
        for id in list {
            let buffer = buffers
                .get(&id.as_u64())
                .with_context(|| format!("buffer {id} not allocated"))?;
            bytes.extend_from_slice(&buffer.data[..buffer.used as usize]);
        }
        Ok(Bytes::from(bytes))
    }
}

impl PlacementEngine for TestPlatform {
    fn calculate_placement(
        &self,
        sizes: &[u64],
        _ctx: &PlacementContext,
    ) -> Result<Vec<PlacementSchema>> {
        let mut schemas = Vec::with_capacity(sizes.len());
        for &size in sizes {
            // Greedy: fastest target with room.
            let mut candidates: Vec<&TargetSlot> = self.targets.iter().collect();
            candidates.sort_by(|lhs, rhs| {
                rhs.bandwidth_mbps
                    .partial_cmp(&lhs.bandwidth_mbps)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let slot = candidates
                .into_iter()
                .find(|slot| slot.capacity_remaining.load(Ordering::Acquire) >= size)
                .with_context(|| format!("no target can hold {size} bytes"))?;
            schemas.push(vec![(size, slot.id)]);
        }
        Ok(schemas)
    }

    fn place_blob(
        &self,
        schema: &PlacementSchema,
        data: &[u8],
        name: &str,
        bucket_id: BucketId,
    ) -> Result<BlobId> {
        let buffers = self.get_buffers(schema);
        if buffers.is_empty() {
            bail!("allocator could not realize schema");
        }

        let mut offset = 0usize;
        for (&id, &(size, _)) in buffers.iter().zip(schema.iter()) {
            let portion = (size as usize).min(data.len() - offset);
            BufferStore::write(self, id, &data[offset..offset + portion], 0)?;
            offset += portion;
        }

        let internal_name = self.make_internal_blob_name(name, bucket_id);
        Ok(self.register_blob(&internal_name, bucket_id, buffers))
    }
}

impl TargetStore for TestPlatform {
    fn node_targets(&self) -> Vec<TargetId> {
        self.targets.iter().map(|slot| slot.id).collect()
    }

    fn bandwidths(&self, targets: &[TargetId]) -> Vec<f32> {
        targets
            .iter()
            .map(|&id| self.slot(id).map(|slot| slot.bandwidth_mbps).unwrap_or(0.0))
            .collect()
    }

    fn remaining_capacities(&self, targets: &[TargetId]) -> Vec<u64> {
        targets
            .iter()
            .map(|&id| {
                self.slot(id)
                    .map(|slot| slot.capacity_remaining.load(Ordering::Acquire))
                    .unwrap_or(0)
            })
            .collect()
    }
}

#[async_trait]
impl LockManager for TestPlatform {
    async fn lock_blob(&self, blob_id: BlobId) -> bool {
        self.local_lock_blob(blob_id)
    }

    async fn unlock_blob(&self, blob_id: BlobId) {
        self.local_unlock_blob(blob_id);
    }

    fn local_lock_blob(&self, blob_id: BlobId) -> bool {
        self.blob_locks.lock().insert(blob_id.as_u64())
    }

    fn local_unlock_blob(&self, blob_id: BlobId) {
        self.blob_locks.lock().remove(&blob_id.as_u64());
    }
}

impl SwapStore for TestPlatform {
    fn read(&self, swap_blob: &SwapBlob) -> Result<Bytes> {
        self.swap
            .lock()
            .get(&swap_blob.offset)
            .map(|data| Bytes::copy_from_slice(data))
            .with_context(|| format!("no swap data at offset {}", swap_blob.offset))
    }

    fn delete(&self, swap_blob: &SwapBlob) -> Result<()> {
        self.swap.lock().remove(&swap_blob.offset);
        Ok(())
    }
}

/// Single-node fixtures reject remote calls; routing tests exercise the
/// prefix logic against [`crate::rpc::BoRpcService`] directly.
#[async_trait]
impl RpcClient for TestPlatform {
    async fn call(&self, node_id: NodeId, func: &str, _args: Bytes) -> Result<Bytes> {
        bail!("test cluster has no remote node {node_id} for {func}");
    }

    async fn notify(&self, node_id: NodeId, func: &str, _args: Bytes) -> Result<()> {
        bail!("test cluster has no remote node {node_id} for {func}");
    }
}

/// Builder for [`TestCluster`].
#[derive(Default)]
pub struct TestClusterBuilder {
    targets: Vec<(f32, u64)>,
    num_workers: usize,
    min_bw: Option<f32>,
    max_bw: Option<f32>,
}

impl TestClusterBuilder {
    /// Add a target with the given bandwidth (MB/s) and capacity (bytes).
    pub fn target(mut self, bandwidth_mbps: f32, capacity: u64) -> Self {
        self.targets.push((bandwidth_mbps, capacity));
        self
    }

    pub fn workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn bandwidth_range(mut self, min_bw: f32, max_bw: f32) -> Self {
        self.min_bw = Some(min_bw);
        self.max_bw = Some(max_bw);
        self
    }

    /// Build the cluster. Must run inside a tokio runtime.
    pub fn build(self) -> TestCluster {
        let platform = Arc::new(TestPlatform::new(&self.targets));

        let min_bw = self.min_bw.unwrap_or_else(|| {
            self.targets
                .iter()
                .map(|&(bw, _)| bw)
                .fold(f32::INFINITY, f32::min)
        });
        let max_bw = self.max_bw.unwrap_or_else(|| {
            self.targets
                .iter()
                .map(|&(bw, _)| bw)
                .fold(f32::NEG_INFINITY, f32::max)
        });

        let config = BoConfig {
            num_worker_threads: if self.num_workers == 0 { 1 } else { self.num_workers },
            queue_capacity: 256,
            min_device_bw_mbps: min_bw,
            max_device_bw_mbps: max_bw,
            flush_tick_ms: 20,
            ..Default::default()
        };

        let ctx = BoContext::builder()
            .buffers(platform.clone())
            .metadata(platform.clone())
            .placement(platform.clone())
            .targets(platform.clone())
            .locks(platform.clone())
            .swap(platform.clone())
            .rpc(platform.clone())
            .node_id(TEST_NODE)
            .build()
            .expect("test context");

        let organizer = BufferOrganizer::new(ctx, config, tokio::runtime::Handle::current());

        TestCluster {
            platform,
            organizer,
        }
    }
}

/// A single-node in-memory deployment for tests.
pub struct TestCluster {
    platform: Arc<TestPlatform>,
    organizer: Arc<BufferOrganizer>,
}

impl TestCluster {
    pub fn builder() -> TestClusterBuilder {
        TestClusterBuilder::default()
    }

    pub fn organizer(&self) -> Arc<BufferOrganizer> {
        self.organizer.clone()
    }

    pub fn platform(&self) -> Arc<TestPlatform> {
        self.platform.clone()
    }

    pub fn node_id(&self) -> NodeId {
        TEST_NODE
    }

    pub fn target(&self, index: usize) -> TargetId {
        self.platform.targets[index].id
    }

    pub fn bucket(&self, name: &str) -> BucketId {
        // Deterministic bucket ids keyed by name length + first byte; tests
        // only need stability, not real hashing.
        let index = name.bytes().next().unwrap_or(0) as u32 + name.len() as u32;
        BucketId::new(TEST_NODE, index)
    }

    /// Allocate one buffer directly, bypassing the placement engine.
    pub fn alloc_buffer(&self, target: TargetId, capacity: u64) -> BufferId {
        self.platform
            .allocate(target, capacity)
            .expect("target out of capacity")
    }

    /// Store `data` as a single-buffer blob on `target` and register it.
    pub fn put_blob(
        &self,
        bucket: &str,
        name: &str,
        data: &[u8],
        target: TargetId,
    ) -> (BlobId, Vec<BufferId>) {
        let bucket_id = self.bucket(bucket);
        let buffer = self.alloc_buffer(target, data.len() as u64);
        BufferStore::write(&*self.platform, buffer, data, 0).expect("write blob data");

        let internal_name = self
            .platform
            .make_internal_blob_name(name, bucket_id);
        let blob_id = self
            .platform
            .register_blob(&internal_name, bucket_id, vec![buffer]);
        (blob_id, vec![buffer])
    }

    /// Store a multi-buffer blob, one buffer per chunk, all on `target`.
    pub fn put_blob_chunks(
        &self,
        bucket: &str,
        name: &str,
        chunks: &[&[u8]],
        target: TargetId,
    ) -> (BlobId, Vec<BufferId>) {
        let bucket_id = self.bucket(bucket);
        let mut buffers = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let buffer = self.alloc_buffer(target, chunk.len() as u64);
            BufferStore::write(&*self.platform, buffer, chunk, 0).expect("write chunk");
            buffers.push(buffer);
        }

        let internal_name = self
            .platform
            .make_internal_blob_name(name, bucket_id);
        let blob_id = self
            .platform
            .register_blob(&internal_name, bucket_id, buffers.clone());
        (blob_id, buffers)
    }

    pub fn set_importance(&self, bucket: &str, name: &str, importance: f32) {
        let internal_name = self
            .platform
            .make_internal_blob_name(name, self.bucket(bucket));
        self.platform
            .metadata
            .lock()
            .importance
            .insert(internal_name, importance);
    }

    pub fn blob_id(&self, bucket: &str, name: &str) -> BlobId {
        let internal_name = self
            .platform
            .make_internal_blob_name(name, self.bucket(bucket));
        self.platform
            .blob_id(&internal_name)
            .expect("blob registered")
    }

    pub fn buffer_list(&self, blob_id: BlobId) -> Vec<BufferId> {
        self.platform.buffer_id_list(blob_id)
    }

    pub fn blob_contents(&self, blob_id: BlobId) -> Vec<u8> {
        self.platform
            .blob_bytes(blob_id)
            .expect("blob readable")
            .to_vec()
    }

    pub fn buffer_contents(&self, id: BufferId) -> Vec<u8> {
        BufferStore::read(&*self.platform, id, 0)
            .expect("buffer readable")
            .to_vec()
    }

    pub fn is_allocated(&self, id: BufferId) -> bool {
        self.platform.buffers.lock().contains_key(&id.as_u64())
    }

    /// Bandwidth of the device currently backing each of the blob's buffers.
    pub fn blob_bandwidths(&self, blob_id: BlobId) -> Vec<f32> {
        let list = self.buffer_list(blob_id);
        list.iter()
            .filter_map(|&id| {
                let header = BufferStore::header(&*self.platform, id)?;
                Some(self.platform.device_bandwidth_mbps(&header))
            })
            .collect()
    }

    /// Seed the swap store and return a descriptor for the data.
    pub fn put_swap_blob(&self, bucket: &str, data: &[u8]) -> SwapBlob {
        let offset = {
            let mut swap = self.platform.swap.lock();
            let offset = (swap.len() as u64 + 1) * 0x10000;
            swap.insert(offset, data.to_vec());
            offset
        };
        SwapBlob {
            node_id: TEST_NODE.0,
            offset,
            size: data.len() as u64,
            bucket_id: self.bucket(bucket),
        }
    }

    pub fn swap_contains(&self, swap_blob: &SwapBlob) -> bool {
        self.platform.swap.lock().contains_key(&swap_blob.offset)
    }

    /// Wait until every task queued before this call has executed. Relies on
    /// the single-worker FIFO ordering of the test pool.
    pub async fn drain(&self, organizer: &BufferOrganizer) {
        let (tx, rx) = oneshot::channel::<()>();
        organizer
            .pool
            .run(
                async move {
                    let _ = tx.send(());
                },
                false,
            )
            .expect("drain sentinel submission");
        let _ = rx.await;
    }
}
