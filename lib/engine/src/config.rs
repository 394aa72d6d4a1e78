// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration.

use std::time::Duration;

use derive_builder::Builder;
use serde::Serialize;

/// Tunables for the admission, queueing, batching and GPU-model layers.
///
/// Construct with [`EngineArgs::builder`]; every field has a default, and
/// `build()` validates the combination.
#[derive(Debug, Clone, Serialize, Builder)]
#[builder(pattern = "owned", build_fn(validate = "Self::validate"))]
pub struct EngineArgs {
    /// Base micro-batching window in milliseconds.
    #[builder(default = "10.0")]
    pub w_base_ms: f64,

    /// Entropy scale for window adaptation: `w = w_base * exp(-H / tau)`.
    #[builder(default = "5.0")]
    pub tau: f64,

    /// Maximum requests per dispatched batch.
    #[builder(default = "16")]
    pub max_batch: usize,

    /// KV-cache budget in tokens.
    #[builder(default = "32768")]
    pub kv_max: usize,

    /// Aging coefficient in priority-units per second of queue wait.
    #[builder(default = "1.0")]
    pub alpha: f64,

    /// Prefill throughput in tokens per second.
    #[builder(default = "1024.0")]
    pub prefill_rate: f64,

    /// Base decode throughput in tokens per second, before batch scaling.
    #[builder(default = "128.0")]
    pub decode_base: f64,

    /// Number of inter-arrival deltas retained by the entropy meter.
    #[builder(default = "50")]
    pub entropy_window: usize,

    /// How many heap candidates the lazy-aged pop rescans.
    /// `None` derives `max_batch * 4`.
    #[builder(default)]
    pub rescan_depth: Option<usize>,

    /// Divide simulated GPU sleeps by this factor to run faster than
    /// real time. Timings reported to clients stay unscaled.
    #[builder(default = "1.0")]
    pub speedup_ratio: f64,

    /// Hourly GPU cost used for the cost-per-million-tokens metric.
    #[builder(default = "3.0")]
    pub gpu_cost_per_hour: f64,
}

impl EngineArgs {
    pub fn builder() -> EngineArgsBuilder {
        EngineArgsBuilder::default()
    }

    pub fn w_base(&self) -> Duration {
        Duration::from_secs_f64(self.w_base_ms / 1000.0)
    }

    /// Rescan depth with the `max_batch * 4` fallback applied.
    pub fn effective_rescan_depth(&self) -> usize {
        self.rescan_depth.unwrap_or(self.max_batch * 4)
    }
}

impl Default for EngineArgs {
    fn default() -> Self {
        Self::builder().build().expect("defaults are valid")
    }
}

impl EngineArgsBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(w) = self.w_base_ms {
            if w <= 0.0 {
                return Err(format!("w_base_ms must be positive, got {w}"));
            }
        }
        if let Some(tau) = self.tau {
            if tau <= 0.0 {
                return Err(format!("tau must be positive, got {tau}"));
            }
        }
        if let Some(n) = self.max_batch {
            if n == 0 {
                return Err("max_batch must be at least 1".to_string());
            }
        }
        if let Some(kv) = self.kv_max {
            if kv == 0 {
                return Err("kv_max must be at least 1".to_string());
            }
        }
        if let Some(alpha) = self.alpha {
            if alpha < 0.0 {
                return Err(format!("alpha must be non-negative, got {alpha}"));
            }
        }
        if let Some(rate) = self.prefill_rate {
            if rate <= 0.0 {
                return Err(format!("prefill_rate must be positive, got {rate}"));
            }
        }
        if let Some(rate) = self.decode_base {
            if rate <= 0.0 {
                return Err(format!("decode_base must be positive, got {rate}"));
            }
        }
        if let Some(n) = self.entropy_window {
            if n < 2 {
                return Err("entropy_window must hold at least 2 deltas".to_string());
            }
        }
        if let Some(Some(depth)) = self.rescan_depth {
            if depth == 0 {
                return Err("rescan_depth must be at least 1".to_string());
            }
        }
        if let Some(ratio) = self.speedup_ratio {
            if ratio <= 0.0 {
                return Err(format!("speedup_ratio must be positive, got {ratio}"));
            }
        }
        Ok(())
    }
}
