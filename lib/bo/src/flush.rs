// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous blob flushing and the per-virtual-bucket drain.
//!
//! A flush serializes a blob to a caller-supplied file path under the blob's
//! distributed lock and an exclusive advisory file lock. Virtual buckets are
//! keyed by backing filename; each carries an outstanding-flush counter that
//! is incremented at enqueue and decremented when the flush completes, with
//! cross-node routing by a hash of the vbucket name.
//!
//! OS failures in the file path are fatal to the process: a partial flush
//! with an unreleased file lock or leaked descriptor corrupts the file and
//! blocks every future flush of it.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::{FileExt as UnixFileExt, OpenOptionsExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use fs2::FileExt;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::organizer::BufferOrganizer;
use crate::types::{BlobId, VBucketId};

/// Bounce-buffer size for streaming blob bytes to the backing file.
const FLUSH_BUFFER_SIZE: usize = 4 * 1024;

/// Abort the process after an unrecoverable OS call failure.
pub(crate) fn failed_library_call(call: &str, error: impl std::fmt::Display) -> ! {
    error!(call, %error, "fatal library call failure in flush path");
    std::process::abort();
}

/// Outstanding-flush state for one virtual bucket.
pub(crate) struct FlushGate {
    pub(crate) count: AtomicI64,
    pub(crate) zero: Notify,
}

/// Per-vbucket outstanding-flush counters, created on first touch.
pub(crate) struct FlushCounters {
    gates: DashMap<u64, Arc<FlushGate>>,
}

impl FlushCounters {
    pub(crate) fn new() -> Self {
        Self {
            gates: DashMap::new(),
        }
    }

    pub(crate) fn gate(&self, id: VBucketId) -> Arc<FlushGate> {
        self.gates
            .entry(id.as_u64())
            .or_insert_with(|| {
                Arc::new(FlushGate {
                    count: AtomicI64::new(0),
                    zero: Notify::new(),
                })
            })
            .clone()
    }

    /// Apply `adjustment` and return the new count, waking drain waiters on
    /// a transition to zero.
    pub(crate) fn adjust(&self, id: VBucketId, adjustment: i64) -> i64 {
        let gate = self.gate(id);
        let count = gate.count.fetch_add(adjustment, Ordering::AcqRel) + adjustment;
        if count == 0 {
            gate.zero.notify_waiters();
        }
        count
    }

    pub(crate) fn outstanding(&self, id: VBucketId) -> i64 {
        self.gates
            .get(&id.as_u64())
            .map(|gate| gate.count.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

/// Write `data` into `path` at `offset`, creating the file with mode 0644
/// when absent, under an exclusive whole-file advisory lock. Any OS failure
/// aborts the process.
fn persist_blob_bytes(path: &str, offset: u64, data: &[u8]) {
    let exists = std::path::Path::new(path).exists();

    let mut options = OpenOptions::new();
    options.write(true);
    if !exists {
        options.create(true).truncate(true).mode(0o644);
    }

    let mut file = match options.open(path) {
        Ok(file) => file,
        Err(error) => failed_library_call("open", error),
    };

    if let Err(error) = FileExt::lock_exclusive(&file) {
        failed_library_call("flock", error);
    }

    // Stream through a fixed bounce buffer rather than handing the kernel
    // one giant write.
    let mut bounce = [0u8; FLUSH_BUFFER_SIZE];
    let mut position = offset;
    for chunk in data.chunks(FLUSH_BUFFER_SIZE) {
        bounce[..chunk.len()].copy_from_slice(chunk);
        if let Err(error) = file.write_all_at(&bounce[..chunk.len()], position) {
            failed_library_call("pwrite", error);
        }
        position += chunk.len() as u64;
    }

    if let Err(error) = file.flush() {
        failed_library_call("flush", error);
    }
    if let Err(error) = FileExt::unlock(&file) {
        failed_library_call("flock", error);
    }
}

impl BufferOrganizer {
    /// Serialize a blob to `filename` at `offset`. With `async_flush`, the
    /// vbucket's outstanding-flush counter is decremented afterwards.
    pub async fn flush_blob(&self, blob_id: BlobId, filename: &str, offset: u64, async_flush: bool) {
        if self.ctx.locks.lock_blob(blob_id).await {
            match self.ctx.metadata.blob_bytes(blob_id) {
                Ok(data) => {
                    debug!(%blob_id, filename, offset, "flushing blob");
                    let path = filename.to_owned();
                    if let Err(join_error) =
                        tokio::task::spawn_blocking(move || persist_blob_bytes(&path, offset, &data))
                            .await
                    {
                        failed_library_call("spawn_blocking", join_error);
                    }
                }
                Err(error) => {
                    warn!(%blob_id, %error, "cannot materialize blob for flush");
                }
            }
            self.ctx.locks.unlock_blob(blob_id).await;
        } else {
            warn!(%blob_id, "could not lock blob for flush");
        }

        if async_flush {
            self.decrement_flush_count(filename).await;
        }
    }

    /// Adapter-facing enqueue: loops back through the RPC layer so the flush
    /// lands on the organizer's dedicated engine.
    pub async fn enqueue_flushing_task(
        &self,
        blob_id: BlobId,
        filename: &str,
        offset: u64,
    ) -> anyhow::Result<bool> {
        self.rpc
            .enqueue_flushing_task(self.ctx.node_id, blob_id, filename, offset)
            .await
    }

    /// Queue an asynchronous flush of `blob_id` to `filename`.
    ///
    /// Returns `false` for swap blobs (swap handling is deferred to the
    /// swap-in path) and when the pool rejects the task.
    pub async fn local_enqueue_flushing_task(
        &self,
        blob_id: BlobId,
        filename: &str,
        offset: u64,
    ) -> bool {
        if blob_id.is_in_swap() {
            return false;
        }

        self.increment_flush_count(filename).await;

        let organizer = self.strong();
        let path = filename.to_owned();
        match self.pool.run(
            async move {
                organizer.flush_blob(blob_id, &path, offset, true).await;
            },
            false,
        ) {
            Ok(()) => true,
            Err(error) => {
                warn!(%blob_id, filename, %error, "flush submission rejected");
                self.decrement_flush_count(filename).await;
                false
            }
        }
    }

    pub(crate) fn local_adjust_flush_count(&self, vbkt_name: &str, adjustment: i64) {
        if let Some(id) = self.ctx.metadata.vbucket_id(vbkt_name) {
            let count = self.flush_counters.adjust(id, adjustment);
            debug!(vbucket = vbkt_name, count, "flush count adjusted");
        }
    }

    pub fn local_increment_flush_count(&self, vbkt_name: &str) {
        self.local_adjust_flush_count(vbkt_name, 1);
    }

    pub fn local_decrement_flush_count(&self, vbkt_name: &str) {
        self.local_adjust_flush_count(vbkt_name, -1);
    }

    /// Increment the vbucket counter on its owning node.
    pub async fn increment_flush_count(&self, vbkt_name: &str) {
        let target_node = self.ctx.metadata.hash_to_node(vbkt_name);
        if target_node == self.ctx.node_id {
            self.local_increment_flush_count(vbkt_name);
        } else if let Err(error) = self
            .rpc
            .remote_increment_flush_count(target_node, vbkt_name)
            .await
        {
            warn!(%target_node, vbkt_name, %error, "failed to increment remote flush count");
        }
    }

    /// Decrement the vbucket counter on its owning node.
    pub async fn decrement_flush_count(&self, vbkt_name: &str) {
        let target_node = self.ctx.metadata.hash_to_node(vbkt_name);
        if target_node == self.ctx.node_id {
            self.local_decrement_flush_count(vbkt_name);
        } else if let Err(error) = self
            .rpc
            .remote_decrement_flush_count(target_node, vbkt_name)
            .await
        {
            warn!(%target_node, vbkt_name, %error, "failed to decrement remote flush count");
        }
    }

    /// Outstanding flushes for a vbucket, wherever its counter lives.
    pub async fn get_num_outstanding_flushing_tasks(&self, id: VBucketId) -> i64 {
        if id.node_id() == self.ctx.node_id {
            self.flush_counters.outstanding(id)
        } else {
            match self
                .rpc
                .remote_get_num_outstanding_flushing_tasks(id.node_id(), id)
                .await
            {
                Ok(count) => count,
                Err(error) => {
                    warn!(vbucket = %id, %error, "failed to read remote flush count");
                    0
                }
            }
        }
    }

    /// Block until the vbucket's outstanding-flush counter reaches zero.
    ///
    /// Local counters wake on the zero transition; a diagnostic tick logs
    /// the remaining count every `flush_log_every` intervals. Remote
    /// counters are polled at the same cadence.
    pub async fn await_async_flushing_tasks(&self, id: VBucketId) {
        let tick = Duration::from_millis(self.config.flush_tick_ms);
        let log_every = self.config.flush_log_every;
        let mut ticks = 0u32;

        if id.node_id() == self.ctx.node_id {
            let gate = self.flush_counters.gate(id);
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // consume the immediate first tick

            loop {
                let outstanding = gate.count.load(Ordering::Acquire);
                if outstanding <= 0 {
                    break;
                }
                // A decrement landing between the load above and the select
                // below is caught by the next diagnostic tick.
                tokio::select! {
                    _ = gate.zero.notified() => {}
                    _ = ticker.tick() => {
                        ticks += 1;
                        if ticks == log_every {
                            info!(vbucket = %id, outstanding, "waiting for outstanding flushes");
                            ticks = 0;
                        }
                    }
                }
            }
        } else {
            loop {
                let outstanding = self.get_num_outstanding_flushing_tasks(id).await;
                if outstanding <= 0 {
                    break;
                }
                ticks += 1;
                if ticks == log_every {
                    info!(vbucket = %id, outstanding, "waiting for outstanding flushes");
                    ticks = 0;
                }
                tokio::time::sleep(tick).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    #[test]
    fn test_counters_adjust_and_report() {
        let counters = FlushCounters::new();
        let id = VBucketId::new(NodeId(1), 4);

        assert_eq!(counters.outstanding(id), 0);
        assert_eq!(counters.adjust(id, 1), 1);
        assert_eq!(counters.adjust(id, 1), 2);
        assert_eq!(counters.adjust(id, -1), 1);
        assert_eq!(counters.adjust(id, -1), 0);
        assert_eq!(counters.outstanding(id), 0);
    }

    #[test]
    fn test_counters_are_per_vbucket() {
        let counters = FlushCounters::new();
        let a = VBucketId::new(NodeId(1), 1);
        let b = VBucketId::new(NodeId(1), 2);

        counters.adjust(a, 3);
        assert_eq!(counters.outstanding(a), 3);
        assert_eq!(counters.outstanding(b), 0);
    }

    #[test]
    fn test_persist_writes_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flush.dat");
        let path_str = path.to_str().unwrap();

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 239) as u8).collect();
        persist_blob_bytes(path_str, 4096, &payload);

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 4096 + payload.len());
        assert_eq!(&on_disk[4096..], &payload[..]);
    }

    #[test]
    fn test_persist_preserves_existing_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flush.dat");
        std::fs::write(&path, vec![0xaau8; 128]).unwrap();

        persist_blob_bytes(path.to_str().unwrap(), 64, &[1, 2, 3, 4]);

        let on_disk = std::fs::read(&path).unwrap();
        // Existing file is opened without truncation.
        assert_eq!(&on_disk[..64], &vec![0xaau8; 64][..]);
        assert_eq!(&on_disk[64..68], &[1, 2, 3, 4]);
        assert_eq!(&on_disk[68..], &vec![0xaau8; 60][..]);
    }
}
