// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Engine front-end and the homeostatic worker loop.
//!
//! [`Engine`] packages the admission registry, the lazy-aged queue, the
//! entropy meter and the metrics behind the public operations. A single
//! background worker adapts its batching window to arrival entropy
//! (`w = w_base * exp(-H / tau)`), drains the queue through the
//! [`BatchBuilder`], dispatches to the GPU backend, and resolves completion
//! handles. Admission and push never suspend; the worker is the sole popper.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::{AdmissionDecision, TenantRegistry, TenantStatus};
use crate::batch::BatchBuilder;
use crate::config::EngineArgs;
use crate::entropy::ArrivalEntropyMeter;
use crate::gpu::{BatchDescriptor, GpuBackend, GpuError, GpuState, PerfModel, SimulatedGpu};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::protocols::{
    CompletionHandle, DispatchError, InferenceOutcome, QueuedRequest, SubmitError,
    MAX_PRIORITY_BID, MIN_PRIORITY_BID,
};
use crate::queue::AgedPriorityQueue;

/// Floor of the adaptive window.
const MIN_WINDOW: Duration = Duration::from_millis(1);

/// `w_base * exp(-entropy / tau)`, clamped to `[1ms, w_base]`. Higher
/// entropy (bursty arrivals) shortens the window to drain the queue before
/// congestion; regular load widens it to grow batches.
pub fn adaptive_window(w_base: Duration, entropy: f64, tau: f64) -> Duration {
    let floor = MIN_WINDOW.min(w_base);
    w_base.mul_f64((-entropy / tau).exp()).clamp(floor, w_base)
}

/// Multi-tenant admission and scheduling engine.
///
/// Owns the background worker; dropping the engine cancels it. Prefer
/// [`Engine::shutdown`] for a clean drain that resolves pending handles
/// with [`DispatchError::Shutdown`].
pub struct Engine {
    args: EngineArgs,
    registry: Arc<TenantRegistry>,
    queue: Arc<Mutex<AgedPriorityQueue>>,
    meter: Arc<Mutex<ArrivalEntropyMeter>>,
    metrics: Arc<EngineMetrics>,
    kv_used: Arc<AtomicUsize>,
    window_micros: Arc<AtomicU64>,
    cancel: CancellationToken,
    worker_handle: Option<JoinHandle<()>>,
}

impl Engine {
    /// Spawn an engine over the given backend. Must be called within a
    /// tokio runtime.
    pub fn new(args: EngineArgs, backend: Box<dyn GpuBackend>) -> Self {
        let registry = Arc::new(TenantRegistry::new());
        let queue = Arc::new(Mutex::new(AgedPriorityQueue::new(
            args.alpha,
            args.effective_rescan_depth(),
        )));
        let meter = Arc::new(Mutex::new(ArrivalEntropyMeter::new(args.entropy_window)));
        let metrics = Arc::new(EngineMetrics::new());
        let kv_used = Arc::new(AtomicUsize::new(0));
        let window_micros = Arc::new(AtomicU64::new(args.w_base().as_micros() as u64));
        let cancel = CancellationToken::new();

        let worker = Worker {
            args: args.clone(),
            builder: BatchBuilder::new(args.max_batch, args.kv_max),
            model: PerfModel::new(args.prefill_rate, args.decode_base),
            backend,
            queue: queue.clone(),
            meter: meter.clone(),
            metrics: metrics.clone(),
            kv_used: kv_used.clone(),
            window_micros: window_micros.clone(),
            cancel: cancel.clone(),
        };
        let worker_handle = tokio::spawn(worker.run());

        Self {
            args,
            registry,
            queue,
            meter,
            metrics,
            kv_used,
            window_micros,
            cancel,
            worker_handle: Some(worker_handle),
        }
    }

    /// Engine backed by the deterministic GPU simulator configured from
    /// `args`.
    pub fn with_simulated_gpu(args: EngineArgs) -> Self {
        let backend = Box::new(SimulatedGpu::new(
            args.prefill_rate,
            args.decode_base,
            args.kv_max,
            args.speedup_ratio,
        ));
        Self::new(args, backend)
    }

    /// Register (or replace) a tenant's rate-limit configuration.
    pub fn register_tenant(&self, tenant_id: &str, rate: f64, burst_cap: f64) {
        self.registry.register(tenant_id, rate, burst_cap);
    }

    /// Validate, admit and enqueue a request. Never suspends; returns the
    /// completion handle the worker resolves after dispatch.
    pub fn submit(
        &self,
        tenant_id: &str,
        prompt: &str,
        tokens_requested: usize,
        priority_bid: u8,
    ) -> Result<CompletionHandle, SubmitError> {
        if !(MIN_PRIORITY_BID..=MAX_PRIORITY_BID).contains(&priority_bid) {
            return Err(SubmitError::InvalidPriority(priority_bid));
        }
        if tokens_requested == 0 || tokens_requested > self.args.kv_max {
            // Anything over kv_max could never fit a batch and would stall
            // at the head forever.
            return Err(SubmitError::InvalidTokens {
                requested: tokens_requested,
                kv_max: self.args.kv_max,
            });
        }

        let now = Instant::now();
        match self.registry.admit(tenant_id, tokens_requested, now) {
            AdmissionDecision::UnknownTenant => {
                self.metrics.record_rejected();
                Err(SubmitError::UnknownTenant(tenant_id.to_string()))
            }
            AdmissionDecision::RateLimited { retry_after } => {
                self.metrics.record_rejected();
                Err(SubmitError::RateLimited { retry_after })
            }
            AdmissionDecision::Admitted => {
                let (request, handle) =
                    QueuedRequest::new(tenant_id, prompt, tokens_requested, priority_bid, now);
                tracing::debug!(
                    request_id = %request.request_id,
                    tenant_id,
                    tokens_requested,
                    priority_bid,
                    "request admitted"
                );
                self.queue
                    .lock()
                    .expect("queue lock poisoned")
                    .push(request, now);
                self.meter
                    .lock()
                    .expect("meter lock poisoned")
                    .record(now);
                self.metrics.record_accepted();
                Ok(handle)
            }
        }
    }

    /// Current bucket state for a tenant.
    pub fn tenant_status(&self, tenant_id: &str) -> Result<TenantStatus, SubmitError> {
        self.registry
            .snapshot(tenant_id, Instant::now())
            .ok_or_else(|| SubmitError::UnknownTenant(tenant_id.to_string()))
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").len()
    }

    /// Point-in-time engine metrics.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let (entropy, burst_state) = {
            let meter = self.meter.lock().expect("meter lock poisoned");
            (meter.entropy(), meter.burst_state())
        };
        self.metrics.snapshot(
            self.queue_depth(),
            self.kv_used.load(Ordering::Relaxed),
            entropy,
            Duration::from_micros(self.window_micros.load(Ordering::Relaxed)),
            burst_state,
            self.args.gpu_cost_per_hour,
        )
    }

    /// Stop the worker. The in-flight batch runs to completion; everything
    /// still queued resolves with [`DispatchError::Shutdown`].
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.worker_handle.take() {
            handle.abort();
        }
    }
}

enum BatchOutcome {
    Completed,
    Fatal(String),
}

struct Worker {
    args: EngineArgs,
    builder: BatchBuilder,
    model: PerfModel,
    backend: Box<dyn GpuBackend>,
    queue: Arc<Mutex<AgedPriorityQueue>>,
    meter: Arc<Mutex<ArrivalEntropyMeter>>,
    metrics: Arc<EngineMetrics>,
    kv_used: Arc<AtomicUsize>,
    window_micros: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let mut gpu_state = GpuState::new(self.args.kv_max);
        tracing::info!(
            w_base_ms = self.args.w_base_ms,
            tau = self.args.tau,
            max_batch = self.args.max_batch,
            kv_max = self.args.kv_max,
            "scheduler worker started"
        );

        let exit_error = loop {
            let entropy = self.meter.lock().expect("meter lock poisoned").entropy();
            let window = adaptive_window(self.args.w_base(), entropy, self.args.tau);
            self.window_micros
                .store(window.as_micros() as u64, Ordering::Relaxed);

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    break DispatchError::Shutdown;
                }

                _ = tokio::time::sleep(window) => {}
            }

            let now = Instant::now();
            let batch = {
                let mut queue = self.queue.lock().expect("queue lock poisoned");
                self.builder.build(&mut queue, gpu_state.kv_used_tokens(), now)
            };
            if batch.is_empty() {
                continue;
            }

            match self.dispatch(batch, &mut gpu_state, now).await {
                BatchOutcome::Completed => {}
                BatchOutcome::Fatal(cause) => {
                    tracing::error!(%cause, "invariant violation; terminating worker");
                    break DispatchError::Internal(cause);
                }
            }
        };

        self.drain_pending(exit_error);
        tracing::info!("scheduler worker stopped");
    }

    /// Dispatch one batch and resolve its handles. The batch resolves
    /// atomically: every request sees the same outcome kind.
    async fn dispatch(
        &self,
        batch: Vec<QueuedRequest>,
        gpu_state: &mut GpuState,
        dispatched_at: Instant,
    ) -> BatchOutcome {
        let descriptor = BatchDescriptor {
            token_counts: batch.iter().map(|r| r.tokens_requested).collect(),
        };
        let batch_tokens = descriptor.total_tokens();
        let predicted = self.model.batch_timing(&descriptor.token_counts);

        gpu_state.reserve(batch_tokens, dispatched_at + predicted.wall_time);
        self.kv_used
            .store(gpu_state.kv_used_tokens(), Ordering::Relaxed);

        let started = tokio::time::Instant::now();
        let result = self.backend.run(&descriptor).await;
        let busy = started.elapsed();

        gpu_state.release(batch_tokens);
        self.kv_used
            .store(gpu_state.kv_used_tokens(), Ordering::Relaxed);

        match result {
            Ok(timing) => {
                let batch_size = batch.len();
                self.metrics.record_batch(
                    batch.iter().map(|r| (r.tenant_id.as_str(), r.tokens_requested)),
                    busy,
                );
                tracing::info!(
                    batch_size,
                    batch_tokens,
                    kv_efficiency = batch_tokens as f64 / self.args.kv_max as f64,
                    wall_ms = timing.wall_time.as_secs_f64() * 1000.0,
                    "batch complete"
                );

                for (mut request, decode_time) in
                    batch.into_iter().zip(timing.decode_times.into_iter())
                {
                    let outcome = InferenceOutcome {
                        request_id: request.request_id,
                        tokens_produced: request.tokens_requested,
                        latency: timing.prefill_time + decode_time,
                        batch_size,
                        queue_wait: dispatched_at.saturating_duration_since(request.arrival_time),
                    };
                    request.respond(Ok(outcome));
                }
                BatchOutcome::Completed
            }
            Err(error @ GpuError::InvariantViolation { .. }) => {
                let cause = error.to_string();
                for mut request in batch {
                    self.metrics.record_failure(&request.tenant_id);
                    request.respond(Err(DispatchError::Internal(cause.clone())));
                }
                BatchOutcome::Fatal(cause)
            }
            Err(error) => {
                let cause = error.to_string();
                tracing::warn!(%cause, "batch dispatch failed");
                for mut request in batch {
                    self.metrics.record_failure(&request.tenant_id);
                    request.respond(Err(DispatchError::Gpu(cause.clone())));
                }
                BatchOutcome::Completed
            }
        }
    }

    /// Resolve everything still queued with the worker's exit cause.
    fn drain_pending(&self, error: DispatchError) {
        let pending = self.queue.lock().expect("queue lock poisoned").drain();
        if pending.is_empty() {
            return;
        }
        tracing::info!(count = pending.len(), "draining pending requests");
        for mut request in pending {
            request.respond(Err(error.clone()));
        }
    }
}
