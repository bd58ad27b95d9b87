// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Blob access scoring and candidate ordering.
//!
//! The access score of a blob summarizes how fast its current placement is:
//! the serial read time of its buffers, normalized against the system-wide
//! device bandwidth interval. Lower score means faster media. The score is
//! well-defined only when every buffer's bandwidth lies inside
//! `[min_device_bw, max_device_bw]`.
//!
//! Note on the normalization: `min_seconds`/`max_seconds` multiply megabytes
//! by MB/s, which is not dimensionally seconds. This matches the deployed
//! behavior and the wire-visible score values, so it is preserved as-is; see
//! DESIGN.md before touching it.

use std::cmp::Ordering;

use crate::types::{BufferInfo, TargetInfo};

const MEGABYTE: u64 = 1024 * 1024;

pub fn bytes_to_megabytes(bytes: u64) -> f32 {
    bytes as f32 / MEGABYTE as f32
}

/// Map a raw serial-read score onto the device bandwidth interval.
pub fn normalize_access_score(raw_score: f32, size_mb: f32, min_bw_mbps: f32, max_bw_mbps: f32) -> f32 {
    let min_seconds = size_mb * min_bw_mbps;
    let max_seconds = size_mb * max_bw_mbps;
    let range = max_seconds - min_seconds;

    (raw_score - min_seconds) / range
}

/// Compute the access score of a blob from its buffer set.
pub fn compute_access_score(buffers: &[BufferInfo], min_bw_mbps: f32, max_bw_mbps: f32) -> f32 {
    let mut raw_score = 0.0f32;
    let mut total_blob_size_mb = 0.0f32;

    for info in buffers {
        let size_mb = bytes_to_megabytes(info.size);
        let seconds_per_mb = 1.0 / info.bandwidth_mbps;

        total_blob_size_mb += size_mb;
        raw_score += size_mb * seconds_per_mb;
    }

    normalize_access_score(raw_score, total_blob_size_mb, min_bw_mbps, max_bw_mbps)
}

/// Whether a blob is at its target: `|importance - access| < epsilon`.
pub fn is_converged(importance_score: f32, access_score: f32, epsilon: f64) -> bool {
    ((importance_score - access_score) as f64).abs() < epsilon
}

/// Bandwidth comparator shared by the buffer and target sorts, parameterized
/// by direction instead of duplicated per direction.
fn compare_bandwidth(lhs: f32, rhs: f32, descending: bool) -> Ordering {
    let ord = lhs.partial_cmp(&rhs).unwrap_or(Ordering::Equal);
    if descending { ord.reverse() } else { ord }
}

/// Order buffers as migration candidates.
///
/// When the score should increase (`increasing == true`, the blob is too
/// fast for its importance) the highest-bandwidth buffers come first; when
/// promoting, the lowest-bandwidth buffers come first. Bandwidth ties break
/// by descending size.
pub fn sort_buffer_info(buffers: &mut [BufferInfo], increasing: bool) {
    buffers.sort_by(|lhs, rhs| {
        match compare_bandwidth(lhs.bandwidth_mbps, rhs.bandwidth_mbps, increasing) {
            Ordering::Equal => rhs.size.cmp(&lhs.size),
            ord => ord,
        }
    });
}

/// Order targets as migration destinations, symmetric with
/// [`sort_buffer_info`]: descending bandwidth when the score should
/// increase, ascending otherwise. The sort is stable, so equal-bandwidth
/// targets keep their store order.
pub fn sort_target_info(targets: &mut [TargetInfo], increasing: bool) {
    targets.sort_by(|lhs, rhs| {
        compare_bandwidth(lhs.bandwidth_mbps, rhs.bandwidth_mbps, increasing)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BufferId, NodeId, TargetId};

    fn buffer(index: u32, bandwidth_mbps: f32, size: u64) -> BufferInfo {
        BufferInfo {
            id: BufferId::new(NodeId(1), index),
            bandwidth_mbps,
            size,
        }
    }

    fn target(index: u32, bandwidth_mbps: f32) -> TargetInfo {
        TargetInfo {
            id: TargetId::new(NodeId(1), index),
            bandwidth_mbps,
            capacity: 0,
        }
    }

    #[test]
    fn test_bytes_to_megabytes() {
        assert_eq!(bytes_to_megabytes(MEGABYTE), 1.0);
        assert_eq!(bytes_to_megabytes(MEGABYTE / 2), 0.5);
    }

    #[test]
    fn test_access_score_two_slow_buffers() {
        // Two 1 MiB buffers at 100 MB/s in a [100, 1000] MB/s system:
        // raw = 2 * (1 / 100) = 0.02, min = 2 * 100, max = 2 * 1000.
        let buffers = vec![buffer(0, 100.0, MEGABYTE), buffer(1, 100.0, MEGABYTE)];
        let score = compute_access_score(&buffers, 100.0, 1000.0);
        let expected = (0.02f32 - 200.0) / 1800.0;
        assert!((score - expected).abs() < 1e-6);
    }

    #[test]
    fn test_faster_placement_scores_lower() {
        let slow = vec![buffer(0, 100.0, MEGABYTE)];
        let fast = vec![buffer(0, 1000.0, MEGABYTE)];
        let slow_score = compute_access_score(&slow, 100.0, 1000.0);
        let fast_score = compute_access_score(&fast, 100.0, 1000.0);
        assert!(fast_score < slow_score);
    }

    #[test]
    fn test_convergence_predicate() {
        assert!(is_converged(0.5, 0.49, 0.05));
        assert!(!is_converged(0.5, 0.44, 0.05));
        assert!(!is_converged(0.5, 0.45, 0.05));
        assert!(is_converged(0.9, 0.9, 0.0001));
    }

    #[test]
    fn test_sort_buffers_increasing_puts_fastest_first() {
        let mut buffers = vec![
            buffer(0, 100.0, MEGABYTE),
            buffer(1, 1000.0, MEGABYTE),
            buffer(2, 500.0, MEGABYTE),
        ];
        sort_buffer_info(&mut buffers, true);
        let bws: Vec<f32> = buffers.iter().map(|b| b.bandwidth_mbps).collect();
        assert_eq!(bws, vec![1000.0, 500.0, 100.0]);
    }

    #[test]
    fn test_sort_buffers_decreasing_puts_slowest_first() {
        let mut buffers = vec![buffer(0, 500.0, MEGABYTE), buffer(1, 100.0, MEGABYTE)];
        sort_buffer_info(&mut buffers, false);
        let bws: Vec<f32> = buffers.iter().map(|b| b.bandwidth_mbps).collect();
        assert_eq!(bws, vec![100.0, 500.0]);
    }

    #[test]
    fn test_sort_buffers_ties_break_by_size_descending() {
        let mut buffers = vec![
            buffer(0, 100.0, MEGABYTE),
            buffer(1, 100.0, 4 * MEGABYTE),
            buffer(2, 100.0, 2 * MEGABYTE),
        ];
        sort_buffer_info(&mut buffers, true);
        let sizes: Vec<u64> = buffers.iter().map(|b| b.size).collect();
        assert_eq!(sizes, vec![4 * MEGABYTE, 2 * MEGABYTE, MEGABYTE]);

        sort_buffer_info(&mut buffers, false);
        let sizes: Vec<u64> = buffers.iter().map(|b| b.size).collect();
        assert_eq!(sizes, vec![4 * MEGABYTE, 2 * MEGABYTE, MEGABYTE]);
    }

    #[test]
    fn test_sort_targets_both_directions() {
        let mut targets = vec![target(0, 100.0), target(1, 6000.0), target(2, 1000.0)];
        sort_target_info(&mut targets, true);
        let bws: Vec<f32> = targets.iter().map(|t| t.bandwidth_mbps).collect();
        assert_eq!(bws, vec![6000.0, 1000.0, 100.0]);

        sort_target_info(&mut targets, false);
        let bws: Vec<f32> = targets.iter().map(|t| t.bandwidth_mbps).collect();
        assert_eq!(bws, vec![100.0, 1000.0, 6000.0]);
    }
}
