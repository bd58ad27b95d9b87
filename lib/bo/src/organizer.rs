// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-node buffer organizer.
//!
//! [`BufferOrganizer`] owns the two-priority worker pool, the outstanding-
//! flush counters, and the typed RPC client, and borrows every other
//! collaborator through [`BoContext`]. Organize requests are routed by a
//! hash of the blob's internal name to the owning node; the owner computes a
//! migration plan and enqueues validated moves into its pool.
//!
//! Organize requests are fire-and-forget hints: failures are logged, never
//! reported to the caller. The next organize cycle reconsiders whatever this
//! one could not do.

use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use strata_bo_config::BoConfig;

use crate::flush::FlushCounters;
use crate::pool::{PoolError, TaskPool};
use crate::rpc::BoRpcApi;
use crate::scoring::{compute_access_score, is_converged, sort_buffer_info, sort_target_info};
use crate::services::{BoContext, TaskSink};
use crate::types::{
    BoPriority, BoTask, BucketId, BufferId, BufferInfo, PlacementSchema, TargetInfo,
    ThresholdViolation, ViolationInfo,
};

/// Per-node organizer state. Construct once at daemon init via [`new`].
///
/// [`new`]: BufferOrganizer::new
pub struct BufferOrganizer {
    pub(crate) ctx: BoContext,
    pub(crate) pool: TaskPool,
    pub(crate) flush_counters: FlushCounters,
    pub(crate) rpc: BoRpcApi,
    pub(crate) config: BoConfig,
    /// Back-reference so `&self` methods can hand an owned handle to pool
    /// jobs. Always upgradable while a caller holds the organizer.
    self_ref: Weak<BufferOrganizer>,
}

impl BufferOrganizer {
    /// Build the organizer and spawn its worker pool on `runtime`.
    pub fn new(ctx: BoContext, config: BoConfig, runtime: tokio::runtime::Handle) -> Arc<Self> {
        let pool = TaskPool::new(config.num_worker_threads, config.queue_capacity, runtime);
        let rpc = BoRpcApi::new(ctx.rpc.clone());

        Arc::new_cyclic(|self_ref| Self {
            ctx,
            pool,
            flush_counters: FlushCounters::new(),
            rpc,
            config,
            self_ref: self_ref.clone(),
        })
    }

    pub fn context(&self) -> &BoContext {
        &self.ctx
    }

    pub fn config(&self) -> &BoConfig {
        &self.config
    }

    pub(crate) fn strong(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("organizer dropped while in use")
    }

    /// Tear down the worker pool. In-flight tasks finish; queued tasks are
    /// dropped. Terminal: the organizer accepts no work afterwards.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Buffer and target introspection
    // ------------------------------------------------------------------

    /// Resolve `{id, bandwidth, size}` for a buffer on this node.
    pub fn local_get_buffer_info(&self, id: BufferId) -> Option<BufferInfo> {
        let header = self.ctx.buffers.header(id)?;
        let bandwidth_mbps = self.ctx.buffers.device_bandwidth_mbps(&header);

        Some(BufferInfo {
            id,
            bandwidth_mbps,
            size: header.used,
        })
    }

    /// Resolve buffer info wherever the buffer lives, dispatching remotely
    /// when another node owns it.
    pub async fn get_buffer_info(&self, id: BufferId) -> Result<BufferInfo> {
        if id.node_id() == self.ctx.node_id {
            self.local_get_buffer_info(id)
                .with_context(|| format!("buffer {id} not found on node {}", self.ctx.node_id))
        } else {
            self.rpc.remote_get_buffer_info(id.node_id(), id).await
        }
    }

    async fn gather_buffer_info(&self, ids: &[BufferId]) -> Result<Vec<BufferInfo>> {
        let mut info = Vec::with_capacity(ids.len());
        for &id in ids {
            info.push(self.get_buffer_info(id).await?);
        }
        Ok(info)
    }

    /// Snapshot the node's targets with bandwidth and remaining capacity.
    fn gather_target_info(&self) -> Vec<TargetInfo> {
        let targets = self.ctx.targets.node_targets();
        let bandwidths = self.ctx.targets.bandwidths(&targets);
        let capacities = self.ctx.targets.remaining_capacities(&targets);

        targets
            .into_iter()
            .zip(bandwidths)
            .zip(capacities)
            .map(|((id, bandwidth_mbps), capacity)| TargetInfo {
                id,
                bandwidth_mbps,
                capacity,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Per-blob reorganization
    // ------------------------------------------------------------------

    /// Nudge a blob's placement toward its importance score.
    ///
    /// Routed by the hash of the blob's internal name; when another node
    /// owns the blob the request is forwarded one-way and this returns
    /// immediately. `epsilon` of `None` uses the configured default;
    /// `importance_score` of `None` reads the score from metadata.
    pub async fn organize_blob(
        &self,
        bucket_id: BucketId,
        blob_name: &str,
        epsilon: Option<f64>,
        importance_score: Option<f32>,
    ) {
        let epsilon = epsilon.unwrap_or(self.config.default_epsilon);
        let internal_name = self
            .ctx
            .metadata
            .make_internal_blob_name(blob_name, bucket_id);
        let target_node = self.ctx.metadata.hash_to_node(&internal_name);

        if target_node == self.ctx.node_id {
            self.local_organize_blob(&internal_name, epsilon, importance_score)
                .await;
        } else if let Err(error) = self
            .rpc
            .remote_organize_blob(target_node, &internal_name, epsilon)
            .await
        {
            warn!(%target_node, internal_name, %error, "failed to forward organize request");
        }
    }

    /// Owner-side organize pass.
    ///
    /// Walks the blob's buffers in candidate order and enqueues single-buffer
    /// migrations whose hypothetical score stays within `epsilon` of the
    /// importance score. Single-buffer swaps give finer convergence control
    /// than whole-blob moves; the validity check prevents oscillation past
    /// the target.
    pub async fn local_organize_blob(
        &self,
        internal_name: &str,
        epsilon: f64,
        explicit_importance: Option<f32>,
    ) {
        let Some(blob_id) = self.ctx.metadata.blob_id(internal_name) else {
            warn!(internal_name, "organize requested for unknown blob");
            return;
        };

        let importance = explicit_importance
            .unwrap_or_else(|| self.ctx.metadata.blob_importance_score(blob_id));

        let buffer_ids = self.ctx.metadata.buffer_id_list(blob_id);
        if buffer_ids.is_empty() {
            debug!(%blob_id, "blob has no buffers to organize");
            return;
        }

        let mut buffer_info = match self.gather_buffer_info(&buffer_ids).await {
            Ok(info) => info,
            Err(error) => {
                warn!(%blob_id, %error, "could not gather buffer info, skipping organize");
                return;
            }
        };

        let min_bw = self.config.min_device_bw_mbps;
        let max_bw = self.config.max_device_bw_mbps;

        let access = compute_access_score(&buffer_info, min_bw, max_bw);
        if is_converged(importance, access, epsilon) {
            debug!(%blob_id, importance, access, "blob already at its target score");
            return;
        }

        let increasing = importance > access;
        sort_buffer_info(&mut buffer_info, increasing);

        for index in 0..buffer_info.len() {
            let candidate = buffer_info[index];

            // Re-read targets every iteration so the pass observes capacity
            // consumed by concurrent allocations (including our own moves).
            let mut target_info = self.gather_target_info();
            sort_target_info(&mut target_info, increasing);

            let Some(target) = target_info
                .iter()
                .copied()
                .find(|target| target.capacity >= candidate.size)
            else {
                continue;
            };

            let schema: PlacementSchema = vec![(candidate.size, target.id)];
            let destinations = self.ctx.buffers.get_buffers(&schema);
            if destinations.is_empty() {
                continue;
            }

            // Score the placement as if only this buffer had moved.
            let mut hypothetical = buffer_info.clone();
            hypothetical[index].bandwidth_mbps = target.bandwidth_mbps;
            let new_access = compute_access_score(&hypothetical, min_bw, max_bw);

            // A move that lands more than epsilon past the importance score
            // would make the next pass reverse it.
            let move_is_valid = if increasing {
                !(new_access > importance && (new_access - importance) as f64 > epsilon)
            } else {
                !(new_access < importance && (importance - new_access) as f64 > epsilon)
            };

            if move_is_valid {
                debug!(
                    %blob_id,
                    src = %candidate.id,
                    target = %target.id,
                    access,
                    new_access,
                    "enqueueing organizer move"
                );
                if let Err(error) =
                    self.local_enqueue_bo_move(candidate.id, destinations, blob_id, BoPriority::Low)
                {
                    warn!(%blob_id, %error, "dropping organizer move");
                }
            } else {
                // Overshoot: hand the pre-allocated destinations back.
                for dest in &destinations {
                    self.ctx.buffers.release(*dest);
                }
            }

            if is_converged(importance, new_access, epsilon) {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Capacity-threshold enforcement
    // ------------------------------------------------------------------

    /// React to a capacity-threshold crossing reported by the monitor,
    /// routing to the violating target's node when remote.
    pub async fn enforce_capacity_thresholds(&self, violation: ViolationInfo) {
        let target_node = violation.target_id.node_id();
        if target_node == self.ctx.node_id {
            self.local_enforce_capacity_thresholds(violation);
        } else if let Err(error) = self
            .rpc
            .remote_enforce_capacity_thresholds(target_node, violation)
            .await
        {
            warn!(%target_node, %error, "failed to forward capacity violation");
        }
    }

    /// Relieve a `Max` violation by moving buffers off the violating target
    /// until `violation_size` bytes of moves are enqueued at high priority.
    /// `Min` violations are the placement engine's to fill and are only
    /// logged here.
    pub fn local_enforce_capacity_thresholds(&self, violation: ViolationInfo) {
        match violation.violation {
            ThresholdViolation::Min => {
                debug!(
                    target = %violation.target_id,
                    size = violation.violation_size,
                    "target below minimum threshold; left to the placement engine"
                );
            }
            ThresholdViolation::Max => {
                let mut remaining = violation.violation_size;

                for (buffer_id, blob_id) in
                    self.ctx.metadata.buffers_on_target(violation.target_id)
                {
                    if remaining == 0 {
                        break;
                    }
                    let Some(info) = self.local_get_buffer_info(buffer_id) else {
                        continue;
                    };

                    let Some(dest) = self
                        .gather_target_info()
                        .into_iter()
                        .find(|t| t.id != violation.target_id && t.capacity >= info.size)
                    else {
                        continue;
                    };

                    let schema: PlacementSchema = vec![(info.size, dest.id)];
                    let destinations = self.ctx.buffers.get_buffers(&schema);
                    if destinations.is_empty() {
                        continue;
                    }

                    match self.local_enqueue_bo_move(
                        buffer_id,
                        destinations,
                        blob_id,
                        BoPriority::High,
                    ) {
                        Ok(()) => remaining = remaining.saturating_sub(info.size),
                        Err(error) => {
                            warn!(%error, "capacity enforcement halted");
                            break;
                        }
                    }
                }

                if remaining > 0 {
                    warn!(
                        target = %violation.target_id,
                        remaining,
                        "could not fully relieve capacity violation"
                    );
                }
            }
        }
    }
}

impl TaskSink for BufferOrganizer {
    fn submit(&self, task: BoTask, priority: BoPriority) -> Result<(), PoolError> {
        self.local_enqueue_bo_task(task, priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::testing::TestCluster;

    #[tokio::test]
    async fn test_local_buffer_info_reflects_device_and_used_bytes() {
        let cluster = TestCluster::builder().target(750.0, 1 << 20).build();
        let organizer = cluster.organizer();

        let (_blob_id, buffers) = cluster.put_blob("bucket", "blob", &[0u8; 300], cluster.target(0));
        let info = organizer.local_get_buffer_info(buffers[0]).unwrap();

        assert_eq!(info.id, buffers[0]);
        assert_eq!(info.size, 300);
        assert_eq!(info.bandwidth_mbps, 750.0);

        let missing = BufferId::new(cluster.node_id(), 0xdead);
        assert!(organizer.local_get_buffer_info(missing).is_none());
    }

    #[tokio::test]
    async fn test_task_sink_accepts_work() {
        let cluster = TestCluster::builder().target(100.0, 1 << 20).build();
        let organizer = cluster.organizer();
        let (_blob_id, buffers) = cluster.put_blob("bucket", "blob", &[1, 2], cluster.target(0));

        let sink: Arc<dyn TaskSink> = organizer.clone();
        sink.submit(BoTask::Delete { src: buffers[0] }, BoPriority::Low)
            .unwrap();

        cluster.drain(&organizer).await;
        assert!(!cluster.is_allocated(buffers[0]));
        organizer.shutdown().await;
    }

    #[tokio::test]
    async fn test_min_violation_moves_nothing() {
        let cluster = TestCluster::builder()
            .target(100.0, 4 << 20)
            .target(1000.0, 4 << 20)
            .build();
        let organizer = cluster.organizer();
        let (blob_id, buffers) =
            cluster.put_blob("bucket", "blob", &[9u8; 4096], cluster.target(0));

        organizer
            .enforce_capacity_thresholds(ViolationInfo {
                target_id: cluster.target(0),
                violation: ThresholdViolation::Min,
                violation_size: 1 << 20,
            })
            .await;
        cluster.drain(&organizer).await;

        assert_eq!(cluster.buffer_list(blob_id), buffers);
        organizer.shutdown().await;
    }
}
