// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Batch assembly under KV-cache and size limits.

use std::time::Instant;

use crate::protocols::QueuedRequest;
use crate::queue::AgedPriorityQueue;

/// Greedy batch assembly: take requests in effective-priority order until
/// the batch is full, the queue is empty, or the next request does not fit
/// the remaining KV budget. The misfit stays at the head rather than being
/// re-sorted behind smaller requests; aging bounds the resulting wait for
/// everything queued behind it.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    max_batch: usize,
    kv_max: usize,
}

impl BatchBuilder {
    pub fn new(max_batch: usize, kv_max: usize) -> Self {
        assert!(max_batch >= 1, "max_batch must be at least 1");
        assert!(kv_max >= 1, "kv_max must be at least 1");
        Self { max_batch, kv_max }
    }

    /// Assemble the next batch at `now` given `kv_used_tokens` already held
    /// by in-flight work. May return an empty batch.
    pub fn build(
        &self,
        queue: &mut AgedPriorityQueue,
        kv_used_tokens: usize,
        now: Instant,
    ) -> Vec<QueuedRequest> {
        let mut budget = self.kv_max.saturating_sub(kv_used_tokens);
        let mut batch = Vec::new();

        while batch.len() < self.max_batch {
            let Some(head) = queue.peek(now) else {
                break;
            };
            if head.tokens_requested > budget {
                // Head-of-line blocking by design: the oversized head waits
                // for KV space instead of letting later requests jump it.
                break;
            }
            let request = queue.pop(now).expect("peek observed an entry");
            budget -= request.tokens_requested;
            batch.push(request);
        }

        if !batch.is_empty() {
            let used: usize = batch.iter().map(|r| r.tokens_requested).sum();
            tracing::debug!(
                batch_size = batch.len(),
                kv_tokens = used,
                kv_efficiency = used as f64 / self.kv_max as f64,
                "assembled batch"
            );
        }
        batch
    }
}
