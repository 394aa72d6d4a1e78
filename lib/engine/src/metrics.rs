// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Engine counters and the observability snapshot.
//!
//! Counters are lock-free; the snapshot derives throughput, utilization,
//! cost and fairness on demand. All wall-time denominators measure from
//! engine start.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::entropy::BurstState;
use crate::protocols::TenantId;

#[derive(Debug)]
pub struct EngineMetrics {
    start_time: Instant,
    total_requests: AtomicU64,
    accepted_requests: AtomicU64,
    rejected_requests: AtomicU64,
    total_batches: AtomicU64,
    batched_requests: AtomicU64,
    total_tokens_produced: AtomicU64,
    gpu_busy_micros: AtomicU64,
    /// Output tokens served per tenant, for Jain's fairness index.
    tenant_tokens: DashMap<TenantId, u64>,
    /// Dispatch failures per tenant.
    tenant_failures: DashMap<TenantId, u64>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_requests: AtomicU64::new(0),
            accepted_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            total_batches: AtomicU64::new(0),
            batched_requests: AtomicU64::new(0),
            total_tokens_produced: AtomicU64::new(0),
            gpu_busy_micros: AtomicU64::new(0),
            tenant_tokens: DashMap::new(),
            tenant_failures: DashMap::new(),
        }
    }

    pub fn record_accepted(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.accepted_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Account a completed batch: per-tenant served tokens and GPU busy time.
    pub fn record_batch<'a>(
        &self,
        served: impl IntoIterator<Item = (&'a str, usize)>,
        busy: Duration,
    ) {
        let mut batch_tokens = 0u64;
        let mut batch_size = 0u64;
        for (tenant_id, tokens) in served {
            batch_tokens += tokens as u64;
            batch_size += 1;
            *self.tenant_tokens.entry(tenant_id.to_string()).or_insert(0) += tokens as u64;
        }
        self.total_batches.fetch_add(1, Ordering::Relaxed);
        self.batched_requests.fetch_add(batch_size, Ordering::Relaxed);
        self.total_tokens_produced
            .fetch_add(batch_tokens, Ordering::Relaxed);
        self.gpu_busy_micros
            .fetch_add(busy.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, tenant_id: &str) {
        *self
            .tenant_failures
            .entry(tenant_id.to_string())
            .or_insert(0) += 1;
    }

    /// Jain's fairness over tokens served per tenant; 1.0 before any tenant
    /// has been served.
    pub fn jain_fairness(&self) -> f64 {
        let xs: Vec<f64> = self
            .tenant_tokens
            .iter()
            .map(|entry| *entry.value() as f64)
            .collect();
        if xs.is_empty() {
            return 1.0;
        }
        let sum: f64 = xs.iter().sum();
        let sum_sq: f64 = xs.iter().map(|x| x * x).sum();
        if sum_sq == 0.0 {
            return 1.0;
        }
        (sum * sum) / (xs.len() as f64 * sum_sq)
    }

    pub fn snapshot(
        &self,
        queue_depth: usize,
        kv_used_tokens: usize,
        current_entropy: f64,
        current_window: Duration,
        burst_state: BurstState,
        gpu_cost_per_hour: f64,
    ) -> MetricsSnapshot {
        let wall_time = self.start_time.elapsed().as_secs_f64().max(1e-9);
        let tokens = self.total_tokens_produced.load(Ordering::Relaxed);
        let busy = self.gpu_busy_micros.load(Ordering::Relaxed) as f64 / 1e6;
        let batches = self.total_batches.load(Ordering::Relaxed);
        let batched = self.batched_requests.load(Ordering::Relaxed);

        let throughput_tps = tokens as f64 / wall_time;
        let cost_per_mtoken = if throughput_tps > 0.0 {
            (gpu_cost_per_hour / 3600.0) / throughput_tps * 1_000_000.0
        } else {
            0.0
        };

        MetricsSnapshot {
            throughput_tps,
            gpu_utilization: busy / wall_time,
            cost_per_mtoken,
            jain_fairness: self.jain_fairness(),
            current_entropy,
            current_window_ms: current_window.as_secs_f64() * 1000.0,
            queue_depth,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            accepted_requests: self.accepted_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            total_batches: batches,
            avg_batch_size: if batches > 0 {
                batched as f64 / batches as f64
            } else {
                0.0
            },
            total_tokens_produced: tokens,
            kv_used_tokens,
            burst_state: match burst_state {
                BurstState::Stable => "stable",
                BurstState::CriticalBurst => "critical_burst",
            },
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the engine, safe to serialize for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub throughput_tps: f64,
    pub gpu_utilization: f64,
    pub cost_per_mtoken: f64,
    pub jain_fairness: f64,
    pub current_entropy: f64,
    pub current_window_ms: f64,
    pub queue_depth: usize,
    pub total_requests: u64,
    pub accepted_requests: u64,
    pub rejected_requests: u64,
    pub total_batches: u64,
    pub avg_batch_size: f64,
    pub total_tokens_produced: u64,
    pub kv_used_tokens: usize,
    pub burst_state: &'static str,
}
