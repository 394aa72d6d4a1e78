// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Gantry engine - multi-tenant admission and scheduling for GPU-backed
//! inference workloads.
//!
//! Requests carry a priority bid and a token budget. The engine admits them
//! under per-tenant token-bucket rate limits, orders them by a lazily aged
//! effective priority, batches them under a bounded KV-cache budget, and
//! dispatches to a GPU backend whose timing model feeds the cost and
//! fairness metrics. The micro-batching window is homeostatic: it shrinks
//! as the Shannon entropy of inter-arrival times rises.
//!
//! HTTP ingress, tenant configuration loading and metrics exposition are
//! external collaborators; this crate is the core they call into.

pub mod admission;
pub mod batch;
pub mod config;
pub mod entropy;
pub mod gpu;
pub mod metrics;
pub mod protocols;
pub mod queue;
pub mod scheduler;

// Re-export the public surface for convenience
pub use admission::{AdmissionDecision, TenantRegistry, TenantStatus};
pub use config::{EngineArgs, EngineArgsBuilder};
pub use entropy::{ArrivalEntropyMeter, BurstState};
pub use gpu::{BatchDescriptor, BatchTiming, GpuBackend, GpuError, SimulatedGpu};
pub use metrics::MetricsSnapshot;
pub use protocols::{
    CompletionHandle, DispatchError, InferenceOutcome, QueuedRequest, SubmitError,
};
pub use scheduler::Engine;
