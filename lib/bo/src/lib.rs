// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Strata Buffer Organizer
//!
//! The per-node component that continuously reshapes the physical placement
//! of buffered blobs across a hierarchy of storage targets, so each blob's
//! realized access score converges toward its policy-assigned importance
//! score. It also drives asynchronous flushing of blobs to a backing
//! filesystem, demand swap-in of evicted blobs, and the per-node move/copy/
//! delete task queue that all of the above feed.
//!
//! # Architecture
//!
//! - [`organizer::BufferOrganizer`]: per-node state, holding the
//!   two-priority worker pool, outstanding-flush counters, and typed RPC
//!   client.
//! - [`services::BoContext`]: the handle bundling the organizer's view of
//!   its collaborators (buffer store, metadata, targets, placement engine,
//!   lock manager, swap store, transport).
//! - [`scoring`]: pure access-score math and candidate ordering.
//! - [`rpc`]: the `BO::`-prefixed wire surface and payload codec.
//!
//! Organize requests are fire-and-forget hints; flushing reports only
//! enqueue success, with drainage observed through the per-vbucket
//! outstanding-flush counter.

pub mod flush;
pub mod mover;
pub mod organizer;
pub mod pool;
pub mod rpc;
pub mod scoring;
pub mod services;
pub mod swap;
pub mod testing;
pub mod types;

pub use mover::CopyHandle;
pub use organizer::BufferOrganizer;
pub use pool::{PoolError, TaskPool};
pub use rpc::{BO_PREFIX, BoRpcApi, BoRpcService, is_bo_function};
pub use services::{
    BoContext, BoContextBuilder, BufferStore, LockManager, MetadataManager, PlacementEngine,
    RpcClient, SwapStore, TargetStore, TaskSink,
};
pub use types::{
    BlobId, BoOperation, BoPriority, BoTask, BucketId, BufferHeader, BufferId, BufferInfo, MapType,
    NodeId, PlacementContext, PlacementPolicy, PlacementSchema, PrefetchContext, PrefetchHint,
    SwapBlob, TargetId, TargetInfo, ThresholdViolation, VBucketId, ViolationInfo,
};
