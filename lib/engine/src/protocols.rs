// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Request, response and error types shared across the engine.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

pub type TenantId = String;

/// Inclusive bounds for `priority_bid`.
pub const MIN_PRIORITY_BID: u8 = 1;
pub const MAX_PRIORITY_BID: u8 = 10;

/// An admitted request waiting in the priority queue.
///
/// Created on admission, immutable afterwards, destroyed once its completion
/// handle has been resolved.
#[derive(Debug)]
pub struct QueuedRequest {
    pub request_id: Uuid,
    pub tenant_id: TenantId,
    pub prompt: String,
    /// Counts against both the tenant bucket and the GPU KV-cache.
    pub tokens_requested: usize,
    /// In `[MIN_PRIORITY_BID, MAX_PRIORITY_BID]`; higher is more urgent.
    pub priority_bid: u8,
    pub arrival_time: Instant,
    resp_tx: Option<oneshot::Sender<Result<InferenceOutcome, DispatchError>>>,
}

impl QueuedRequest {
    /// Build a request together with the client-side completion handle.
    pub fn new(
        tenant_id: impl Into<TenantId>,
        prompt: impl Into<String>,
        tokens_requested: usize,
        priority_bid: u8,
        arrival_time: Instant,
    ) -> (Self, CompletionHandle) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            request_id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            prompt: prompt.into(),
            tokens_requested,
            priority_bid,
            arrival_time,
            resp_tx: Some(tx),
        };
        (request, CompletionHandle { rx })
    }

    /// Resolve the completion handle. A dropped receiver means the client
    /// stopped waiting; that is not an engine error.
    pub fn respond(&mut self, result: Result<InferenceOutcome, DispatchError>) {
        let Some(tx) = self.resp_tx.take() else {
            tracing::error!(request_id = %self.request_id, "respond called multiple times on same request");
            return;
        };
        if tx.send(result).is_err() {
            tracing::debug!(request_id = %self.request_id, "completion receiver dropped before resolution");
        }
    }
}

/// Client-side future for a submitted request.
#[derive(Debug)]
pub struct CompletionHandle {
    rx: oneshot::Receiver<Result<InferenceOutcome, DispatchError>>,
}

impl CompletionHandle {
    /// Wait for the scheduler to resolve this request.
    pub async fn wait(self) -> Result<InferenceOutcome, DispatchError> {
        match self.rx.await {
            Ok(result) => result,
            // The sender only disappears if the engine was torn down without
            // draining, which the worker treats as an internal fault.
            Err(_) => Err(DispatchError::Internal(
                "engine dropped the request without resolving it".to_string(),
            )),
        }
    }
}

/// Per-request result delivered on the completion handle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceOutcome {
    pub request_id: Uuid,
    pub tokens_produced: usize,
    /// Modeled service time for this request (prefill + its decode share).
    pub latency: Duration,
    /// Size of the batch this request was dispatched in.
    pub batch_size: usize,
    /// Time spent queued between admission and dispatch.
    pub queue_wait: Duration,
}

/// Synchronous rejections at `submit`; these never enter the queue.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubmitError {
    #[error("unknown tenant '{0}'")]
    UnknownTenant(TenantId),

    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("priority bid {0} outside [{MIN_PRIORITY_BID}, {MAX_PRIORITY_BID}]")]
    InvalidPriority(u8),

    #[error("tokens_requested {requested} outside (0, {kv_max}]")]
    InvalidTokens { requested: usize, kv_max: usize },
}

/// Failures surfaced on completion handles. A batch resolves atomically:
/// every request in it carries the same cause.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("gpu backend failure: {0}")]
    Gpu(String),

    #[error("engine shut down before dispatch")]
    Shutdown,

    #[error("internal invariant violation: {0}")]
    Internal(String),
}
