// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Organizer RPC surface.
//!
//! The organizer runs its handlers on a dedicated engine, separate from the
//! latency-sensitive metadata engine, so long-running organizer work never
//! sits in front of metadata traffic. Functions belonging to that engine
//! carry the `BO::` prefix on the wire name; the client layer detects the
//! prefix, selects the engine, and strips it before transmission. Callers go
//! through [`BoRpcApi`]; the transport hands inbound calls to
//! [`BoRpcService::dispatch`].

pub mod wire;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bytes::{BufMut, Bytes, BytesMut};

use crate::organizer::BufferOrganizer;
use crate::services::RpcClient;
use crate::types::{
    BlobId, BoPriority, BoTask, BufferId, BufferInfo, NodeId, VBucketId, ViolationInfo,
};
use wire::{WireDecode, WireEncode, get_bool, get_f64, get_str, get_u64, put_bool, put_str};

/// Prefix that routes a function name to the organizer's dedicated engine.
pub const BO_PREFIX: &str = "BO::";

/// Length of [`BO_PREFIX`] in bytes.
pub const BO_PREFIX_LENGTH: usize = BO_PREFIX.len();

/// Whether `func_name` belongs to the organizer engine.
pub fn is_bo_function(func_name: &str) -> bool {
    func_name.as_bytes().starts_with(BO_PREFIX.as_bytes())
}

/// Wire names of the organizer's entry points, as callers spell them.
pub mod names {
    pub const REMOTE_GET_BUFFER_INFO: &str = "RemoteGetBufferInfo";
    pub const REMOTE_ORGANIZE_BLOB: &str = "RemoteOrganizeBlob";
    pub const REMOTE_INCREMENT_FLUSH_COUNT: &str = "RemoteIncrementFlushCount";
    pub const REMOTE_DECREMENT_FLUSH_COUNT: &str = "RemoteDecrementFlushCount";
    pub const REMOTE_GET_NUM_OUTSTANDING_FLUSHING_TASKS: &str =
        "RemoteGetNumOutstandingFlushingTasks";
    pub const REMOTE_ENFORCE_CAPACITY_THRESHOLDS: &str = "RemoteEnforceCapacityThresholds";
    pub const ENQUEUE_FLUSHING_TASK: &str = "BO::EnqueueFlushingTask";
    pub const ENQUEUE_BO_MOVE: &str = "BO::EnqueueBoMove";
    pub const ENQUEUE_BO_TASK: &str = "BO::EnqueueBoTask";
}

/// Typed client over the transport for the organizer's entry points.
pub struct BoRpcApi {
    rpc: Arc<dyn RpcClient>,
}

impl BoRpcApi {
    pub fn new(rpc: Arc<dyn RpcClient>) -> Self {
        Self { rpc }
    }

    pub async fn remote_get_buffer_info(
        &self,
        node_id: NodeId,
        id: BufferId,
    ) -> Result<BufferInfo> {
        let mut reply = self
            .rpc
            .call(node_id, names::REMOTE_GET_BUFFER_INFO, id.to_bytes())
            .await?;
        Ok(BufferInfo::decode(&mut reply)?)
    }

    /// One-way: the remote organizer works at its own pace.
    pub async fn remote_organize_blob(
        &self,
        node_id: NodeId,
        internal_name: &str,
        epsilon: f64,
    ) -> Result<()> {
        let mut buf = BytesMut::new();
        put_str(&mut buf, internal_name);
        buf.put_f64_le(epsilon);
        self.rpc
            .notify(node_id, names::REMOTE_ORGANIZE_BLOB, buf.freeze())
            .await
    }

    pub async fn remote_increment_flush_count(
        &self,
        node_id: NodeId,
        vbkt_name: &str,
    ) -> Result<bool> {
        let mut buf = BytesMut::new();
        put_str(&mut buf, vbkt_name);
        let mut reply = self
            .rpc
            .call(node_id, names::REMOTE_INCREMENT_FLUSH_COUNT, buf.freeze())
            .await?;
        Ok(get_bool(&mut reply)?)
    }

    pub async fn remote_decrement_flush_count(
        &self,
        node_id: NodeId,
        vbkt_name: &str,
    ) -> Result<bool> {
        let mut buf = BytesMut::new();
        put_str(&mut buf, vbkt_name);
        let mut reply = self
            .rpc
            .call(node_id, names::REMOTE_DECREMENT_FLUSH_COUNT, buf.freeze())
            .await?;
        Ok(get_bool(&mut reply)?)
    }

    pub async fn remote_get_num_outstanding_flushing_tasks(
        &self,
        node_id: NodeId,
        id: VBucketId,
    ) -> Result<i64> {
        let mut reply = self
            .rpc
            .call(
                node_id,
                names::REMOTE_GET_NUM_OUTSTANDING_FLUSHING_TASKS,
                id.to_bytes(),
            )
            .await?;
        Ok(wire::get_i32(&mut reply)? as i64)
    }

    pub async fn remote_enforce_capacity_thresholds(
        &self,
        node_id: NodeId,
        violation: ViolationInfo,
    ) -> Result<()> {
        self.rpc
            .notify(
                node_id,
                names::REMOTE_ENFORCE_CAPACITY_THRESHOLDS,
                violation.to_bytes(),
            )
            .await
    }

    pub async fn enqueue_flushing_task(
        &self,
        node_id: NodeId,
        blob_id: BlobId,
        filename: &str,
        offset: u64,
    ) -> Result<bool> {
        let mut buf = BytesMut::new();
        blob_id.encode(&mut buf);
        put_str(&mut buf, filename);
        buf.put_u64_le(offset);
        let mut reply = self
            .rpc
            .call(node_id, names::ENQUEUE_FLUSHING_TASK, buf.freeze())
            .await?;
        Ok(get_bool(&mut reply)?)
    }

    pub async fn enqueue_bo_move(
        &self,
        node_id: NodeId,
        src: BufferId,
        destinations: &[BufferId],
        blob_id: BlobId,
        priority: BoPriority,
    ) -> Result<bool> {
        let mut buf = BytesMut::new();
        src.encode(&mut buf);
        wire::put_buffer_ids(&mut buf, destinations);
        blob_id.encode(&mut buf);
        priority.encode(&mut buf);
        let mut reply = self
            .rpc
            .call(node_id, names::ENQUEUE_BO_MOVE, buf.freeze())
            .await?;
        Ok(get_bool(&mut reply)?)
    }

    pub async fn enqueue_bo_task(
        &self,
        node_id: NodeId,
        task: &BoTask,
        priority: BoPriority,
    ) -> Result<bool> {
        let mut buf = BytesMut::new();
        task.encode(&mut buf);
        priority.encode(&mut buf);
        let mut reply = self
            .rpc
            .call(node_id, names::ENQUEUE_BO_TASK, buf.freeze())
            .await?;
        Ok(get_bool(&mut reply)?)
    }
}

/// Server side of the organizer surface. The transport hands inbound calls
/// here; organizer-engine names may arrive with or without the prefix.
pub struct BoRpcService {
    organizer: Arc<BufferOrganizer>,
}

impl BoRpcService {
    pub fn new(organizer: Arc<BufferOrganizer>) -> Self {
        Self { organizer }
    }

    pub async fn dispatch(&self, func_name: &str, mut payload: Bytes) -> Result<Bytes> {
        let func = func_name.strip_prefix(BO_PREFIX).unwrap_or(func_name);

        match func {
            "RemoteGetBufferInfo" => {
                let id = BufferId::decode(&mut payload)?;
                let info = self
                    .organizer
                    .local_get_buffer_info(id)
                    .with_context(|| format!("buffer {id} not found on this node"))?;
                Ok(info.to_bytes())
            }
            "RemoteOrganizeBlob" => {
                let internal_name = get_str(&mut payload)?;
                let epsilon = get_f64(&mut payload)?;
                self.organizer
                    .local_organize_blob(&internal_name, epsilon, None)
                    .await;
                Ok(Bytes::new())
            }
            "RemoteIncrementFlushCount" => {
                let vbkt_name = get_str(&mut payload)?;
                self.organizer.local_increment_flush_count(&vbkt_name);
                Ok(bool_reply(true))
            }
            "RemoteDecrementFlushCount" => {
                let vbkt_name = get_str(&mut payload)?;
                self.organizer.local_decrement_flush_count(&vbkt_name);
                Ok(bool_reply(true))
            }
            "RemoteGetNumOutstandingFlushingTasks" => {
                let id = VBucketId::decode(&mut payload)?;
                let count = self.organizer.get_num_outstanding_flushing_tasks(id).await;
                let mut buf = BytesMut::new();
                buf.put_i32_le(count as i32);
                Ok(buf.freeze())
            }
            "RemoteEnforceCapacityThresholds" => {
                let violation = ViolationInfo::decode(&mut payload)?;
                self.organizer.local_enforce_capacity_thresholds(violation);
                Ok(Bytes::new())
            }
            "EnqueueFlushingTask" => {
                let blob_id = BlobId::decode(&mut payload)?;
                let filename = get_str(&mut payload)?;
                let offset = get_u64(&mut payload)?;
                let queued = self
                    .organizer
                    .local_enqueue_flushing_task(blob_id, &filename, offset)
                    .await;
                Ok(bool_reply(queued))
            }
            "EnqueueBoMove" => {
                let src = BufferId::decode(&mut payload)?;
                let destinations = wire::get_buffer_ids(&mut payload)?;
                let blob_id = BlobId::decode(&mut payload)?;
                let priority = BoPriority::decode(&mut payload)?;
                let queued = self
                    .organizer
                    .local_enqueue_bo_move(src, destinations, blob_id, priority)
                    .is_ok();
                Ok(bool_reply(queued))
            }
            "EnqueueBoTask" => {
                let task = BoTask::decode(&mut payload)?;
                let priority = BoPriority::decode(&mut payload)?;
                let queued = self.organizer.local_enqueue_bo_task(task, priority).is_ok();
                Ok(bool_reply(queued))
            }
            other => bail!("unknown organizer rpc: {other}"),
        }
    }
}

fn bool_reply(value: bool) -> Bytes {
    let mut buf = BytesMut::new();
    put_bool(&mut buf, value);
    buf.freeze()
}
