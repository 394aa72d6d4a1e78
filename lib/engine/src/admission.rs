// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Token-bucket admission control, keyed by tenant.
//!
//! Each tenant owns a bucket that refills continuously at `rate` tokens per
//! second up to `burst_cap`. Admission is whole-or-nothing: a request either
//! consumes its full `tokens_requested` or leaves the bucket untouched. The
//! refill runs before the check so capacity accumulated since the last call
//! is honored.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::protocols::TenantId;

/// Outcome of an admission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    Admitted,
    UnknownTenant,
    RateLimited {
        /// Time until the deficit refills at the tenant's rate.
        retry_after: Duration,
    },
}

#[derive(Debug)]
struct TenantBucket {
    /// Tokens replenished per second.
    rate: f64,
    /// Maximum accumulated tokens.
    burst_cap: f64,
    /// Current balance, always in `[0, burst_cap]`.
    tokens: f64,
    last_update: Instant,
}

impl TenantBucket {
    fn new(rate: f64, burst_cap: f64, now: Instant) -> Self {
        // Buckets start full so a new tenant can burst immediately.
        Self {
            rate,
            burst_cap,
            tokens: burst_cap,
            last_update: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst_cap);
        self.last_update = now;
    }

    fn try_consume(&mut self, amount: f64, now: Instant) -> AdmissionDecision {
        self.refill(now);
        if self.tokens >= amount {
            self.tokens -= amount;
            debug_assert!(self.tokens >= 0.0 && self.tokens <= self.burst_cap);
            AdmissionDecision::Admitted
        } else {
            let deficit = amount - self.tokens;
            AdmissionDecision::RateLimited {
                retry_after: Duration::from_secs_f64(deficit / self.rate),
            }
        }
    }
}

/// Bucket state reported for observability.
#[derive(Debug, Clone, Serialize)]
pub struct TenantStatus {
    pub tokens: f64,
    pub rate: f64,
    pub burst_cap: f64,
    /// Fraction of the burst capacity currently consumed.
    pub utilization: f64,
}

/// Per-tenant token buckets behind sharded locks. `admit` never suspends.
#[derive(Debug, Default)]
pub struct TenantRegistry {
    buckets: DashMap<TenantId, TenantBucket>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tenant, replacing any existing configuration. The bucket
    /// initializes at full capacity.
    pub fn register(&self, tenant_id: &str, rate: f64, burst_cap: f64) {
        assert!(rate > 0.0, "rate must be positive");
        assert!(burst_cap >= rate, "burst_cap must be at least rate");
        tracing::info!(tenant_id, rate, burst_cap, "registered tenant");
        self.buckets.insert(
            tenant_id.to_string(),
            TenantBucket::new(rate, burst_cap, Instant::now()),
        );
    }

    /// Attempt to consume `tokens_requested` from the tenant's bucket at `now`.
    pub fn admit(&self, tenant_id: &str, tokens_requested: usize, now: Instant) -> AdmissionDecision {
        let Some(mut bucket) = self.buckets.get_mut(tenant_id) else {
            return AdmissionDecision::UnknownTenant;
        };
        let decision = bucket.try_consume(tokens_requested as f64, now);
        if let AdmissionDecision::RateLimited { retry_after } = &decision {
            tracing::debug!(
                tenant_id,
                tokens_requested,
                remaining = bucket.tokens,
                retry_after_ms = retry_after.as_millis() as u64,
                "admission rejected"
            );
        }
        decision
    }

    /// Refresh and report the tenant's bucket state.
    pub fn snapshot(&self, tenant_id: &str, now: Instant) -> Option<TenantStatus> {
        let mut bucket = self.buckets.get_mut(tenant_id)?;
        bucket.refill(now);
        Some(TenantStatus {
            tokens: bucket.tokens,
            rate: bucket.rate,
            burst_cap: bucket.burst_cap,
            utilization: 1.0 - bucket.tokens / bucket.burst_cap,
        })
    }

    pub fn contains(&self, tenant_id: &str) -> bool {
        self.buckets.contains_key(tenant_id)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(tenant: &str, rate: f64, burst_cap: f64) -> TenantRegistry {
        let registry = TenantRegistry::new();
        registry.register(tenant, rate, burst_cap);
        registry
    }

    #[test]
    fn unknown_tenant_rejected() {
        let registry = TenantRegistry::new();
        assert_eq!(
            registry.admit("ghost", 1, Instant::now()),
            AdmissionDecision::UnknownTenant
        );
    }

    #[test]
    fn admission_drains_bucket() {
        let registry = registry_with("tenant_a", 1000.0, 1000.0);
        let now = Instant::now();

        assert_eq!(
            registry.admit("tenant_a", 100, now),
            AdmissionDecision::Admitted
        );
        let status = registry.snapshot("tenant_a", now).unwrap();
        assert!((status.tokens - 900.0).abs() < 1e-9);
    }

    #[test]
    fn rejection_leaves_balance_untouched() {
        let registry = registry_with("tenant_b", 10.0, 10.0);
        let now = Instant::now();

        assert_eq!(registry.admit("tenant_b", 5, now), AdmissionDecision::Admitted);
        assert_eq!(registry.admit("tenant_b", 5, now), AdmissionDecision::Admitted);
        // Bucket holds 0; the third request must not partially consume.
        assert!(matches!(
            registry.admit("tenant_b", 5, now),
            AdmissionDecision::RateLimited { .. }
        ));
        let status = registry.snapshot("tenant_b", now).unwrap();
        assert!(status.tokens.abs() < 1e-9);
    }

    #[test]
    fn refill_honors_elapsed_time() {
        let registry = registry_with("tenant_a", 100.0, 1000.0);
        let t0 = Instant::now();

        assert_eq!(
            registry.admit("tenant_a", 1000, t0),
            AdmissionDecision::Admitted
        );
        // Empty at t0; 500ms later 50 tokens have accrued.
        let t1 = t0 + Duration::from_millis(500);
        assert!(matches!(
            registry.admit("tenant_a", 51, t1),
            AdmissionDecision::RateLimited { .. }
        ));
        assert_eq!(
            registry.admit("tenant_a", 50, t1),
            AdmissionDecision::Admitted
        );
    }

    #[test]
    fn refill_caps_at_burst() {
        let registry = registry_with("tenant_a", 1000.0, 100.0);
        let t0 = Instant::now();
        assert_eq!(
            registry.admit("tenant_a", 100, t0),
            AdmissionDecision::Admitted
        );

        // An hour of refill still caps at burst_cap.
        let t1 = t0 + Duration::from_secs(3600);
        let status = registry.snapshot("tenant_a", t1).unwrap();
        assert!((status.tokens - 100.0).abs() < 1e-9);
        assert!(matches!(
            registry.admit("tenant_a", 101, t1),
            AdmissionDecision::RateLimited { .. }
        ));
    }

    #[test]
    fn retry_after_reflects_deficit() {
        let registry = registry_with("tenant_a", 10.0, 10.0);
        let t0 = Instant::now();
        assert_eq!(
            registry.admit("tenant_a", 10, t0),
            AdmissionDecision::Admitted
        );

        match registry.admit("tenant_a", 5, t0) {
            AdmissionDecision::RateLimited { retry_after } => {
                // 5 tokens at 10/s.
                assert!((retry_after.as_secs_f64() - 0.5).abs() < 1e-6);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn bucket_stays_bounded_under_random_admits() {
        let registry = registry_with("tenant_a", 50.0, 200.0);
        let mut now = Instant::now();

        for step in 0..1000 {
            now += Duration::from_millis((step % 37) as u64);
            let _ = registry.admit("tenant_a", (step % 60) as usize, now);
            let status = registry.snapshot("tenant_a", now).unwrap();
            assert!(
                status.tokens >= 0.0 && status.tokens <= 200.0,
                "bucket out of bounds at step {step}: {}",
                status.tokens
            );
        }
    }

    #[test]
    fn admitted_tokens_never_exceed_refill_plus_burst() {
        let rate = 40.0;
        let burst = 120.0;
        let registry = registry_with("tenant_a", rate, burst);
        let t0 = Instant::now();

        let mut admitted = 0.0;
        let mut now = t0;
        for step in 0..2000u64 {
            now = t0 + Duration::from_millis(step * 7);
            let amount = (step % 23 + 1) as usize;
            if registry.admit("tenant_a", amount, now) == AdmissionDecision::Admitted {
                admitted += amount as f64;
            }
        }

        let wall = now.duration_since(t0).as_secs_f64();
        assert!(
            admitted <= burst + rate * wall + 1e-6,
            "admitted {admitted} tokens exceeds burst + rate * wall = {}",
            burst + rate * wall
        );
    }

    #[test]
    fn reregistering_resets_bucket() {
        let registry = registry_with("tenant_a", 10.0, 10.0);
        let now = Instant::now();
        assert_eq!(
            registry.admit("tenant_a", 10, now),
            AdmissionDecision::Admitted
        );

        registry.register("tenant_a", 20.0, 40.0);
        let status = registry.snapshot("tenant_a", Instant::now()).unwrap();
        assert!((status.burst_cap - 40.0).abs() < 1e-9);
        assert!((status.tokens - 40.0).abs() < 1e-9);
    }
}
