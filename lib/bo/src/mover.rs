// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Executors for the organizer's move/copy/delete tasks, and the enqueue
//! adapters that bind them to the worker pool.
//!
//! A move never leaves a partially migrated blob behind: the buffer-list
//! rewrite is the final step, happens only after every byte has landed, and
//! is atomic inside the metadata plane. Every abandon path releases the
//! pre-allocated destination buffers.

use anyhow::{Context, Result, bail};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::organizer::BufferOrganizer;
use crate::pool::PoolError;
use crate::types::{BlobId, BoPriority, BoTask, BufferId, PlacementSchema, TargetId};

/// Completion side-channel for an enqueued copy; resolves to the freshly
/// allocated buffer id.
pub struct CopyHandle {
    rx: oneshot::Receiver<Result<BufferId>>,
}

impl CopyHandle {
    pub async fn wait(self) -> Result<BufferId> {
        self.rx.await.context("copy task dropped before completing")?
    }
}

impl BufferOrganizer {
    // ------------------------------------------------------------------
    // Enqueue adapters
    // ------------------------------------------------------------------

    /// Queue a buffer migration. On submission failure the pre-allocated
    /// destinations are released and the error returned.
    pub fn local_enqueue_bo_move(
        &self,
        src: BufferId,
        destinations: Vec<BufferId>,
        blob_id: BlobId,
        priority: BoPriority,
    ) -> Result<(), PoolError> {
        let organizer = self.strong();
        let job_destinations = destinations.clone();

        let submitted = self.pool.run(
            async move {
                organizer.bo_move(src, job_destinations, blob_id).await;
            },
            matches!(priority, BoPriority::High),
        );

        if let Err(error) = &submitted {
            warn!(%src, %blob_id, %error, "move submission rejected");
            for dest in &destinations {
                self.ctx.buffers.release(*dest);
            }
        }
        submitted
    }

    /// Queue a buffer copy; the returned handle resolves to the new buffer
    /// id once the worker has finished.
    pub fn local_enqueue_bo_copy(
        &self,
        src: BufferId,
        dest: TargetId,
        priority: BoPriority,
    ) -> Result<CopyHandle, PoolError> {
        let (tx, rx) = oneshot::channel();
        let organizer = self.strong();

        self.pool.run(
            async move {
                let result = organizer.bo_copy(src, dest).await;
                if let Err(error) = &result {
                    warn!(%src, %dest, %error, "buffer copy failed");
                }
                let _ = tx.send(result);
            },
            matches!(priority, BoPriority::High),
        )?;

        Ok(CopyHandle { rx })
    }

    /// Bind the right executor for `task` and submit it.
    pub fn local_enqueue_bo_task(&self, task: BoTask, priority: BoPriority) -> Result<(), PoolError> {
        match task {
            BoTask::Move {
                src,
                destinations,
                blob_id,
            } => self.local_enqueue_bo_move(src, destinations, blob_id, priority),
            BoTask::Copy { src, dest } => {
                // The wire form has no completion channel; drop the handle.
                self.local_enqueue_bo_copy(src, dest, priority).map(|_| ())
            }
            BoTask::Delete { src } => {
                let organizer = self.strong();
                self.pool.run(
                    async move {
                        organizer.bo_delete(src).await;
                    },
                    matches!(priority, BoPriority::High),
                )
            }
        }
    }

    // ------------------------------------------------------------------
    // Executors
    // ------------------------------------------------------------------

    /// Move one buffer's contents into pre-allocated destinations and
    /// rewrite the owning blob's buffer list.
    ///
    /// Failures are non-fatal: the move is abandoned, destinations are
    /// released, and the blob list is left untouched.
    pub(crate) async fn bo_move(&self, src: BufferId, destinations: Vec<BufferId>, blob_id: BlobId) {
        if !self.ctx.locks.local_lock_blob(blob_id) {
            warn!(%blob_id, "could not lock blob, abandoning move");
            for dest in &destinations {
                self.ctx.buffers.release(*dest);
            }
            return;
        }

        match self.execute_move(src, &destinations, blob_id) {
            Ok(new_blob_id) => {
                debug!(%src, %blob_id, %new_blob_id, "move complete");
            }
            Err(error) => {
                warn!(%src, %blob_id, %error, "abandoning move");
                for dest in &destinations {
                    self.ctx.buffers.release(*dest);
                }
            }
        }

        self.ctx.locks.local_unlock_blob(blob_id);
    }

    fn execute_move(
        &self,
        src: BufferId,
        destinations: &[BufferId],
        blob_id: BlobId,
    ) -> Result<BlobId> {
        let src_header = self
            .ctx
            .buffers
            .header(src)
            .with_context(|| format!("source buffer {src} not found on this node"))?;

        let data = self.ctx.buffers.read(src, 0)?;
        debug_assert_eq!(data.len() as u64, src_header.used);

        let mut offset = 0usize;
        let mut remaining = data.len();
        for &dest in destinations {
            if remaining == 0 {
                break;
            }
            let dest_header = self
                .ctx
                .buffers
                .header(dest)
                .with_context(|| format!("destination buffer {dest} not found on this node"))?;

            let portion = remaining.min(dest_header.capacity as usize);
            self.ctx
                .buffers
                .write(dest, &data[offset..offset + portion], 0)?;
            offset += portion;
            remaining -= portion;
        }

        // Destinations were pre-sized by the reorganizer; anything left over
        // means the plan was stale and the blob list must not change.
        if remaining != 0 {
            bail!("destinations lack capacity for {remaining} trailing bytes");
        }

        let new_blob_id = self
            .ctx
            .metadata
            .replace_buffer_ids(blob_id, src, destinations)?;
        self.ctx.buffers.release(src);

        Ok(new_blob_id)
    }

    /// Duplicate a buffer's contents into a fresh buffer on `dest`.
    pub(crate) async fn bo_copy(&self, src: BufferId, dest: TargetId) -> Result<BufferId> {
        let src_header = self
            .ctx
            .buffers
            .header(src)
            .with_context(|| format!("copy source {src} not found on this node"))?;

        let data = self.ctx.buffers.read(src, 0)?;

        let schema: PlacementSchema = vec![(src_header.used, dest)];
        let allocated = self.ctx.buffers.get_buffers(&schema);
        if allocated.len() != 1 {
            for id in &allocated {
                self.ctx.buffers.release(*id);
            }
            bail!("target {dest} could not provide a single buffer for copy");
        }

        let new_id = allocated[0];
        self.ctx.buffers.write(new_id, &data, 0)?;
        debug!(%src, %new_id, "copy complete");

        Ok(new_id)
    }

    /// Release a buffer back to its target's free list.
    pub(crate) async fn bo_delete(&self, src: BufferId) {
        self.ctx.buffers.release(src);
        if let Some(blob_id) = self.ctx.metadata.drop_buffer_reference(src) {
            debug!(%src, %blob_id, "blob released its last buffer and is now deletable");
        } else {
            debug!(%src, "buffer released");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::TestCluster;
    use crate::types::{BoPriority, BoTask};

    #[tokio::test]
    async fn test_move_splits_across_destinations() {
        let cluster = TestCluster::builder()
            .target(100.0, 64 << 20)
            .target(1000.0, 64 << 20)
            .build();
        let organizer = cluster.organizer();

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let (blob_id, buffers) = cluster.put_blob("bucket", "blob", &payload, cluster.target(0));
        assert_eq!(buffers.len(), 1);

        // Two half-size destinations on the fast target.
        let dest_a = cluster.alloc_buffer(cluster.target(1), 2048);
        let dest_b = cluster.alloc_buffer(cluster.target(1), 2048);

        organizer
            .bo_move(buffers[0], vec![dest_a, dest_b], blob_id)
            .await;

        let new_blob_id = cluster.blob_id("bucket", "blob");
        let list = cluster.buffer_list(new_blob_id);
        assert_eq!(list, vec![dest_a, dest_b]);

        // Mass conservation: destination bytes concatenate to the source.
        assert_eq!(cluster.blob_contents(new_blob_id), payload);
        // The source buffer went back to the free list.
        assert!(!cluster.is_allocated(buffers[0]));
    }

    #[tokio::test]
    async fn test_move_abandons_on_missing_destination() {
        let cluster = TestCluster::builder()
            .target(100.0, 64 << 20)
            .target(1000.0, 64 << 20)
            .build();
        let organizer = cluster.organizer();

        let payload = vec![7u8; 1024];
        let (blob_id, buffers) = cluster.put_blob("bucket", "blob", &payload, cluster.target(0));

        let bogus = crate::types::BufferId::new(cluster.node_id(), 0xffff_ffff);
        organizer.bo_move(buffers[0], vec![bogus], blob_id).await;

        // Blob list untouched, contents intact.
        assert_eq!(cluster.buffer_list(blob_id), buffers);
        assert_eq!(cluster.blob_contents(blob_id), payload);
    }

    #[tokio::test]
    async fn test_copy_duplicates_contents() {
        let cluster = TestCluster::builder()
            .target(100.0, 64 << 20)
            .target(1000.0, 64 << 20)
            .build();
        let organizer = cluster.organizer();

        let payload = vec![42u8; 512];
        let (_blob_id, buffers) = cluster.put_blob("bucket", "blob", &payload, cluster.target(0));

        let handle = organizer
            .local_enqueue_bo_copy(buffers[0], cluster.target(1), BoPriority::High)
            .unwrap();
        let new_id = handle.wait().await.unwrap();

        assert_eq!(cluster.buffer_contents(new_id), payload);
        // Source untouched.
        assert_eq!(cluster.buffer_contents(buffers[0]), payload);
        organizer.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_task_releases_buffer() {
        let cluster = TestCluster::builder().target(100.0, 64 << 20).build();
        let organizer = cluster.organizer();

        let (_blob_id, buffers) = cluster.put_blob("bucket", "blob", &[1, 2, 3], cluster.target(0));
        organizer
            .local_enqueue_bo_task(BoTask::Delete { src: buffers[0] }, BoPriority::High)
            .unwrap();

        cluster.drain(&organizer).await;
        assert!(!cluster.is_allocated(buffers[0]));
        organizer.shutdown().await;
    }
}
