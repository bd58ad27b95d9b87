// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end organizer scenarios against the in-memory test cluster.

use std::time::Duration;

use strata_bo::scoring::compute_access_score;
use strata_bo::testing::TestCluster;
use strata_bo::types::{BufferInfo, ThresholdViolation, ViolationInfo};

const MIB: u64 = 1 << 20;

fn chunk(byte: u8) -> Vec<u8> {
    vec![byte; MIB as usize]
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_promote_moves_blob_to_fast_tier() {
    init_tracing();
    // Two 1 MiB buffers on the slow tier, a fast tier with room, and a high
    // importance score: both buffers should land on the fast tier.
    let cluster = TestCluster::builder()
        .target(100.0, 8 * MIB)
        .target(1000.0, 8 * MIB)
        .build();
    let organizer = cluster.organizer();

    let (part_a, part_b) = (chunk(0x11), chunk(0x22));
    let (_blob_id, original) =
        cluster.put_blob_chunks("bucket", "weights", &[&part_a, &part_b], cluster.target(0));

    organizer
        .organize_blob(cluster.bucket("bucket"), "weights", Some(0.05), Some(0.9))
        .await;
    cluster.drain(&organizer).await;

    let blob_id = cluster.blob_id("bucket", "weights");
    let bandwidths = cluster.blob_bandwidths(blob_id);
    assert_eq!(bandwidths.len(), 2);
    assert!(bandwidths.iter().all(|&bw| bw >= 900.0), "{bandwidths:?}");

    // Contents survive the migration and the old buffers are freed.
    let mut expected = part_a.clone();
    expected.extend_from_slice(&part_b);
    assert_eq!(cluster.blob_contents(blob_id), expected);
    for id in original {
        assert!(!cluster.is_allocated(id));
    }

    organizer.shutdown().await;
}

#[tokio::test]
async fn test_demote_with_only_slow_capacity_stays_slow() {
    // The fast tier has no remaining capacity, so a demotion pass can only
    // land buffers back on the slow tier.
    let cluster = TestCluster::builder()
        .target(100.0, 8 * MIB)
        .target(1000.0, 0)
        .build();
    let organizer = cluster.organizer();

    let (part_a, part_b) = (chunk(0x33), chunk(0x44));
    cluster.put_blob_chunks("bucket", "scratch", &[&part_a, &part_b], cluster.target(0));

    organizer
        .organize_blob(cluster.bucket("bucket"), "scratch", Some(0.05), Some(0.1))
        .await;
    cluster.drain(&organizer).await;

    let blob_id = cluster.blob_id("bucket", "scratch");
    let bandwidths = cluster.blob_bandwidths(blob_id);
    assert!(
        bandwidths.iter().all(|&bw| (bw - 100.0).abs() < f32::EPSILON),
        "{bandwidths:?}"
    );

    let mut expected = part_a.clone();
    expected.extend_from_slice(&part_b);
    assert_eq!(cluster.blob_contents(blob_id), expected);

    organizer.shutdown().await;
}

#[tokio::test]
async fn test_organize_within_epsilon_enqueues_nothing() {
    let cluster = TestCluster::builder()
        .target(100.0, 8 * MIB)
        .target(1000.0, 8 * MIB)
        .build();
    let organizer = cluster.organizer();

    let (part_a, part_b) = (chunk(0x55), chunk(0x66));
    let (blob_id, original) =
        cluster.put_blob_chunks("bucket", "steady", &[&part_a, &part_b], cluster.target(0));

    // Importance exactly at the current access score: already converged.
    let info: Vec<BufferInfo> = original
        .iter()
        .map(|&id| BufferInfo {
            id,
            bandwidth_mbps: 100.0,
            size: MIB,
        })
        .collect();
    let access = compute_access_score(&info, 100.0, 1000.0);

    organizer
        .organize_blob(cluster.bucket("bucket"), "steady", Some(0.05), Some(access))
        .await;
    cluster.drain(&organizer).await;

    assert_eq!(cluster.blob_id("bucket", "steady"), blob_id);
    assert_eq!(cluster.buffer_list(blob_id), original);

    organizer.shutdown().await;
}

#[tokio::test]
async fn test_capacity_bounded_buffer_is_not_migrated() {
    // The fast tier has only 0.5 MiB left; a 1 MiB buffer must not be
    // migrated there, and with nowhere else to go the pass is a no-op.
    let cluster = TestCluster::builder()
        .target(100.0, MIB)
        .target(1000.0, MIB / 2)
        .build();
    let organizer = cluster.organizer();

    let data = chunk(0x77);
    let (blob_id, original) = cluster.put_blob("bucket", "pinned", &data, cluster.target(0));

    organizer
        .organize_blob(cluster.bucket("bucket"), "pinned", Some(0.05), Some(0.9))
        .await;
    cluster.drain(&organizer).await;

    assert_eq!(cluster.blob_id("bucket", "pinned"), blob_id);
    assert_eq!(cluster.buffer_list(blob_id), original);

    organizer.shutdown().await;
}

#[tokio::test]
async fn test_organize_unknown_blob_is_fire_and_forget() {
    let cluster = TestCluster::builder().target(100.0, 8 * MIB).build();
    let organizer = cluster.organizer();

    organizer
        .organize_blob(cluster.bucket("bucket"), "never-created", None, None)
        .await;
    cluster.drain(&organizer).await;
    organizer.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_flush_drain() {
    init_tracing();
    let cluster = TestCluster::builder()
        .target(100.0, 64 * MIB)
        .workers(4)
        .build();
    let organizer = cluster.organizer();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backing.dat");
    let path_str = path.to_str().unwrap();

    let payload = vec![0x5au8; 64 * 1024];
    let (blob_id, _buffers) = cluster.put_blob("bucket", "logfile", &payload, cluster.target(0));

    for _ in 0..10 {
        assert!(
            organizer
                .local_enqueue_flushing_task(blob_id, path_str, 0)
                .await
        );
    }

    let vbucket = organizer.context().metadata.vbucket_id(path_str).unwrap();
    tokio::time::timeout(
        Duration::from_secs(10),
        organizer.await_async_flushing_tasks(vbucket),
    )
    .await
    .expect("drain should complete once all flushes finish");

    assert_eq!(organizer.get_num_outstanding_flushing_tasks(vbucket).await, 0);
    assert_eq!(std::fs::read(&path).unwrap(), payload);

    organizer.shutdown().await;
}

#[tokio::test]
async fn test_flush_of_swap_blob_is_rejected() {
    let cluster = TestCluster::builder().target(100.0, 8 * MIB).build();
    let organizer = cluster.organizer();

    let (blob_id, _buffers) = cluster.put_blob("bucket", "evicted", &[1, 2, 3], cluster.target(0));
    let queued = organizer
        .local_enqueue_flushing_task(blob_id.to_swap(), "ignored", 0)
        .await;
    assert!(!queued);

    organizer.shutdown().await;
}

#[tokio::test]
async fn test_max_capacity_violation_moves_buffers_off_target() {
    let cluster = TestCluster::builder()
        .target(100.0, 8 * MIB)
        .target(1000.0, 8 * MIB)
        .build();
    let organizer = cluster.organizer();

    for (index, name) in ["a", "b", "c"].iter().enumerate() {
        let data = chunk(index as u8);
        cluster.put_blob("bucket", name, &data, cluster.target(0));
    }

    organizer
        .enforce_capacity_thresholds(ViolationInfo {
            target_id: cluster.target(0),
            violation: ThresholdViolation::Max,
            violation_size: 2 * MIB,
        })
        .await;
    cluster.drain(&organizer).await;

    // At least two of the three blobs should now sit on the fast target.
    let moved = ["a", "b", "c"]
        .iter()
        .filter(|name| {
            let blob_id = cluster.blob_id("bucket", name);
            cluster
                .blob_bandwidths(blob_id)
                .iter()
                .all(|&bw| bw >= 900.0)
        })
        .count();
    assert!(moved >= 2, "only {moved} blobs moved");

    organizer.shutdown().await;
}
