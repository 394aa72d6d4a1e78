// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shannon entropy of request inter-arrival times.
//!
//! The meter keeps a bounded ring of the most recent inter-arrival deltas
//! and computes the entropy of their empirical distribution over 1ms-wide
//! integer bins. Perfectly periodic arrivals give 0 bits; arrivals spread
//! uniformly over distinct millisecond bins saturate at `log2(window)`.
//! The scheduler uses the value to shrink its batching window under bursty
//! traffic and widen it under regular load.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Entropy below which arrivals are considered a synchronized burst.
pub const CRITICAL_ENTROPY_THRESHOLD: f64 = 1.5;

/// Arrival-stream classification derived from the current entropy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstState {
    Stable,
    CriticalBurst,
}

#[derive(Debug)]
pub struct ArrivalEntropyMeter {
    /// Ring of the last `capacity` inter-arrival deltas, oldest first.
    deltas: VecDeque<Duration>,
    capacity: usize,
    last_arrival_time: Option<Instant>,
}

impl ArrivalEntropyMeter {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "entropy window must hold at least 2 deltas");
        Self {
            deltas: VecDeque::with_capacity(capacity),
            capacity,
            last_arrival_time: None,
        }
    }

    /// Record an arrival at `now`. The first call only seeds the reference
    /// timestamp; non-monotonic timestamps are dropped.
    pub fn record(&mut self, now: Instant) {
        if let Some(prev) = self.last_arrival_time.replace(now) {
            let Some(delta) = now.checked_duration_since(prev) else {
                return;
            };
            if self.deltas.len() == self.capacity {
                self.deltas.pop_front();
            }
            self.deltas.push_back(delta);
        }
    }

    /// Shannon entropy in bits of the 1ms-binned delta distribution.
    ///
    /// Binning is integer millisecond truncation; the 1ms granularity is a
    /// contract with the window-adaptation tests.
    pub fn entropy(&self) -> f64 {
        if self.deltas.len() < 2 {
            return 0.0;
        }

        let mut bins: HashMap<u128, usize> = HashMap::new();
        for delta in &self.deltas {
            *bins.entry(delta.as_millis()).or_insert(0) += 1;
        }

        let total = self.deltas.len() as f64;
        bins.values()
            .map(|&count| {
                let p = count as f64 / total;
                -p * p.log2()
            })
            .sum()
    }

    pub fn burst_state(&self) -> BurstState {
        if self.entropy() < CRITICAL_ENTROPY_THRESHOLD {
            BurstState::CriticalBurst
        } else {
            BurstState::Stable
        }
    }

    /// Number of deltas currently in the window.
    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}
