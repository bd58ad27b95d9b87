// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Demand swap-in: rematerialize a swapped-out blob into the hierarchy.

use anyhow::{Context, Result};
use tracing::{debug, error};

use crate::organizer::BufferOrganizer;
use crate::types::{PlacementContext, SwapBlob};

impl BufferOrganizer {
    /// Bring a swapped-out blob back into the buffer hierarchy under its
    /// original name and bucket.
    ///
    /// On placement failure the swap blob is left intact and the error
    /// propagates; the caller may retry with a different placement context.
    pub async fn place_in_hierarchy(
        &self,
        swap_blob: SwapBlob,
        name: &str,
        ctx: &PlacementContext,
    ) -> Result<()> {
        let sizes = [swap_blob.size];
        let schemas = match self.ctx.placement.calculate_placement(&sizes, ctx) {
            Ok(schemas) => schemas,
            Err(error) => {
                error!(%error, size = swap_blob.size, "swap-in placement failed");
                return Err(error);
            }
        };
        let schema = schemas
            .first()
            .context("placement engine returned no schema")?;

        let data = self.ctx.swap.read(&swap_blob)?;
        let blob_id = self
            .ctx
            .placement
            .place_blob(schema, &data, name, swap_blob.bucket_id)?;

        self.ctx.swap.delete(&swap_blob)?;
        debug!(%blob_id, name, size = swap_blob.size, "swap blob rematerialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::TestCluster;
    use crate::types::PlacementContext;

    #[tokio::test]
    async fn test_swap_in_places_blob_under_original_name() {
        let cluster = TestCluster::builder()
            .target(100.0, 64 << 20)
            .target(1000.0, 64 << 20)
            .build();
        let organizer = cluster.organizer();

        let payload: Vec<u8> = (0..9000u32).map(|i| (i % 97) as u8).collect();
        let swap_blob = cluster.put_swap_blob("bucket", &payload);

        organizer
            .place_in_hierarchy(swap_blob, "swapped", &PlacementContext::default())
            .await
            .unwrap();

        let blob_id = cluster.blob_id("bucket", "swapped");
        assert_eq!(cluster.blob_contents(blob_id), payload);
        assert!(!cluster.swap_contains(&swap_blob));
    }

    #[tokio::test]
    async fn test_failed_placement_leaves_swap_blob_intact() {
        // One tiny target: nothing can hold the blob.
        let cluster = TestCluster::builder().target(100.0, 1024).build();
        let organizer = cluster.organizer();

        let payload = vec![5u8; 8192];
        let swap_blob = cluster.put_swap_blob("bucket", &payload);

        let result = organizer
            .place_in_hierarchy(swap_blob, "swapped", &PlacementContext::default())
            .await;

        assert!(result.is_err());
        assert!(cluster.swap_contains(&swap_blob));
    }
}
