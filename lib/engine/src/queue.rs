// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lazy-aged priority queue.
//!
//! The heap is ordered by the static key `(-priority_bid, seq)` and is never
//! rebuilt as entries age. At pop time the queue rescans a bounded prefix of
//! candidates in heap order, recomputes each one's effective priority
//! `P_eff = -(priority_bid + alpha * wait_seconds)`, and returns the entry
//! with the smallest `(P_eff, seq)`. Within one bid class aging preserves
//! insertion order, so the true minimum is always the oldest entry of some
//! bid class and the rescan prefix covers the heads of all ten classes.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use uuid::Uuid;

use crate::protocols::QueuedRequest;

/// Entry in the aged heap. Insertion ordering ignores aging; `seq` is the
/// deterministic tiebreaker assigned at push.
struct HeapEntry {
    neg_base_priority: i32,
    arrival_time: Instant,
    seq: u64,
    request: QueuedRequest,
}

impl HeapEntry {
    fn static_key(&self) -> (i32, u64) {
        (self.neg_base_priority, self.seq)
    }

    /// Effective priority at `now`; smaller means more urgent.
    fn effective_key(&self, now: Instant, alpha: f64) -> f64 {
        let wait = now.saturating_duration_since(self.arrival_time).as_secs_f64();
        -(f64::from(self.request.priority_bid) + alpha * wait)
    }
}

impl Eq for HeapEntry {}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.static_key() == other.static_key()
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest (neg_bid, seq)
        // surfaces first.
        other.static_key().cmp(&self.static_key())
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Non-destructive view of the entry `pop` would return at the same `now`.
#[derive(Debug, Clone, Copy)]
pub struct PeekedRequest {
    pub request_id: Uuid,
    pub tokens_requested: usize,
    pub priority_bid: u8,
    pub arrival_time: Instant,
}

pub struct AgedPriorityQueue {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
    alpha: f64,
    rescan_depth: usize,
}

impl AgedPriorityQueue {
    pub fn new(alpha: f64, rescan_depth: usize) -> Self {
        assert!(alpha >= 0.0, "alpha must be non-negative");
        assert!(rescan_depth >= 1, "rescan_depth must be at least 1");
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            alpha,
            rescan_depth,
        }
    }

    /// Insert a request, stamping it with a fresh `seq`.
    pub fn push(&mut self, request: QueuedRequest, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry {
            neg_base_priority: -i32::from(request.priority_bid),
            arrival_time: now,
            seq,
            request,
        });
    }

    /// Remove and return the entry with the minimum effective key at `now`.
    pub fn pop(&mut self, now: Instant) -> Option<QueuedRequest> {
        self.take_best(now).map(|entry| entry.request)
    }

    /// Report the entry `pop(now)` would return, without removing it.
    pub fn peek(&mut self, now: Instant) -> Option<PeekedRequest> {
        let entry = self.take_best(now)?;
        let view = PeekedRequest {
            request_id: entry.request.request_id,
            tokens_requested: entry.request.tokens_requested,
            priority_bid: entry.request.priority_bid,
            arrival_time: entry.arrival_time,
        };
        self.heap.push(entry);
        Some(view)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove everything, in no particular order. Shutdown path.
    pub fn drain(&mut self) -> Vec<QueuedRequest> {
        self.heap.drain().map(|entry| entry.request).collect()
    }

    /// Pop up to `rescan_depth` candidates in heap order, keep the one with
    /// the smallest `(P_eff(now), seq)`, and reinsert the rest. Successive
    /// heap pops yield the k smallest static keys regardless of internal
    /// layout, so the candidate set — and therefore the selection — is a
    /// deterministic function of (contents, now).
    fn take_best(&mut self, now: Instant) -> Option<HeapEntry> {
        let k = self.rescan_depth.min(self.heap.len());
        if k == 0 {
            return None;
        }

        let mut candidates: Vec<HeapEntry> = Vec::with_capacity(k);
        for _ in 0..k {
            candidates.push(self.heap.pop().expect("len checked above"));
        }

        let mut best = 0;
        let mut best_key = candidates[0].effective_key(now, self.alpha);
        for (idx, entry) in candidates.iter().enumerate().skip(1) {
            let key = entry.effective_key(now, self.alpha);
            let better = match key.partial_cmp(&best_key) {
                Some(Ordering::Less) => true,
                Some(Ordering::Equal) => entry.seq < candidates[best].seq,
                _ => false,
            };
            if better {
                best = idx;
                best_key = key;
            }
        }

        let chosen = candidates.swap_remove(best);
        for entry in candidates {
            self.heap.push(entry);
        }
        Some(chosen)
    }
}
