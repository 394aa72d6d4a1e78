// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Modeled GPU backend.
//!
//! The worker owns a [`GpuBackend`] trait object; [`SimulatedGpu`] is the
//! stand-in used in tests and development, with a deterministic
//! prefill/decode timing model. Any real backend honoring the same contract
//! can replace it.

use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Tokens per request handed to the backend; the builder has already bounded
/// the sum by the KV budget.
#[derive(Debug, Clone)]
pub struct BatchDescriptor {
    pub token_counts: Vec<usize>,
}

impl BatchDescriptor {
    pub fn total_tokens(&self) -> usize {
        self.token_counts.iter().sum()
    }

    pub fn len(&self) -> usize {
        self.token_counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_counts.is_empty()
    }
}

/// Timing report for one executed batch.
#[derive(Debug, Clone)]
pub struct BatchTiming {
    /// Time to first token: longest prefill in the batch.
    pub prefill_time: Duration,
    /// Decode time per request, same order as the descriptor.
    pub decode_times: Vec<Duration>,
    /// `prefill_time + max(decode_times)`.
    pub wall_time: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    /// The builder must never produce a batch over the KV budget; seeing one
    /// here is an engine bug and terminates the worker.
    #[error("kv budget exceeded: batch holds {batch_tokens} tokens, kv_max is {kv_max}")]
    InvariantViolation { batch_tokens: usize, kv_max: usize },

    #[error("backend failure: {0}")]
    Backend(String),
}

#[async_trait]
pub trait GpuBackend: Send + Sync {
    /// Execute one batch and report its timing. Implementations suspend for
    /// the duration of the work; the caller serializes dispatches.
    async fn run(&self, batch: &BatchDescriptor) -> Result<BatchTiming, GpuError>;
}

/// KV-cache occupancy and dispatch horizon, owned by the worker.
#[derive(Debug)]
pub struct GpuState {
    kv_used_tokens: usize,
    kv_max: usize,
    busy_until: Option<Instant>,
}

impl GpuState {
    pub fn new(kv_max: usize) -> Self {
        Self {
            kv_used_tokens: 0,
            kv_max,
            busy_until: None,
        }
    }

    pub fn kv_used_tokens(&self) -> usize {
        self.kv_used_tokens
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        self.busy_until.is_none_or(|t| t <= now)
    }

    /// Reserve KV for a batch about to dispatch.
    pub fn reserve(&mut self, tokens: usize, until: Instant) {
        self.kv_used_tokens += tokens;
        debug_assert!(self.kv_used_tokens <= self.kv_max);
        self.busy_until = Some(until);
    }

    /// Release KV after a batch completes (or fails).
    pub fn release(&mut self, tokens: usize) {
        self.kv_used_tokens = self.kv_used_tokens.saturating_sub(tokens);
        self.busy_until = None;
    }
}

/// Deterministic performance model shared by the simulator and by anything
/// that wants to predict batch cost.
///
/// Prefill processes input tokens in parallel, bottlenecked by the longest
/// request. Decode amortizes across the batch: per-item throughput is
/// `decode_base * (0.4 + 0.6 * sqrt(batch_size))`, saturating around 2.5x
/// at batch size 16.
#[derive(Debug, Clone)]
pub struct PerfModel {
    prefill_rate: f64,
    decode_base: f64,
}

impl PerfModel {
    pub fn new(prefill_rate: f64, decode_base: f64) -> Self {
        Self {
            prefill_rate,
            decode_base,
        }
    }

    pub fn per_item_decode_rate(&self, batch_size: usize) -> f64 {
        self.decode_base * (0.4 + 0.6 * (batch_size as f64).sqrt())
    }

    pub fn batch_timing(&self, token_counts: &[usize]) -> BatchTiming {
        if token_counts.is_empty() {
            return BatchTiming {
                prefill_time: Duration::ZERO,
                decode_times: Vec::new(),
                wall_time: Duration::ZERO,
            };
        }

        let max_input = token_counts.iter().copied().max().unwrap_or(0);
        let prefill_time = Duration::from_secs_f64(max_input as f64 / self.prefill_rate);

        let rate = self.per_item_decode_rate(token_counts.len());
        let decode_times: Vec<Duration> = token_counts
            .iter()
            .map(|&tokens| Duration::from_secs_f64(tokens as f64 / rate))
            .collect();
        let max_decode = decode_times.iter().copied().max().unwrap_or(Duration::ZERO);

        BatchTiming {
            prefill_time,
            decode_times,
            wall_time: prefill_time + max_decode,
        }
    }
}

/// Simulated GPU: sleeps for the modeled wall time (divided by
/// `speedup_ratio`) and returns unscaled timings.
pub struct SimulatedGpu {
    model: PerfModel,
    kv_max: usize,
    speedup_ratio: f64,
}

impl SimulatedGpu {
    pub fn new(prefill_rate: f64, decode_base: f64, kv_max: usize, speedup_ratio: f64) -> Self {
        Self {
            model: PerfModel::new(prefill_rate, decode_base),
            kv_max,
            speedup_ratio,
        }
    }
}

#[async_trait]
impl GpuBackend for SimulatedGpu {
    async fn run(&self, batch: &BatchDescriptor) -> Result<BatchTiming, GpuError> {
        let batch_tokens = batch.total_tokens();
        if batch_tokens > self.kv_max {
            return Err(GpuError::InvariantViolation {
                batch_tokens,
                kv_max: self.kv_max,
            });
        }

        let timing = self.model.batch_timing(&batch.token_counts);
        tracing::debug!(
            batch_size = batch.len(),
            batch_tokens,
            prefill_ms = timing.prefill_time.as_secs_f64() * 1000.0,
            wall_ms = timing.wall_time.as_secs_f64() * 1000.0,
            "simulating batch"
        );
        tokio::time::sleep(timing.wall_time.div_f64(self.speedup_ratio)).await;
        Ok(timing)
    }
}
