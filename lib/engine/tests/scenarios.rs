// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scheduling scenarios driving the public engine surface.
//!
//! Timing-sensitive cases run under tokio's paused clock: simulated GPU
//! sleeps auto-advance, so multi-second batches finish in microseconds of
//! real time while the modeled timings stay exact.

use std::time::{Duration, Instant};

use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gantry_engine::entropy::ArrivalEntropyMeter;
use gantry_engine::protocols::QueuedRequest;
use gantry_engine::queue::AgedPriorityQueue;
use gantry_engine::scheduler::adaptive_window;
use gantry_engine::{Engine, EngineArgs, SubmitError};

fn default_engine() -> Engine {
    Engine::with_simulated_gpu(EngineArgs::default())
}

// S1: one tenant, one request, no contention.
#[tokio::test(start_paused = true)]
async fn s1_single_request_flows_through() -> anyhow::Result<()> {
    let engine = default_engine();
    engine.register_tenant("tenant_a", 1000.0, 1000.0);

    let handle = engine.submit("tenant_a", "hello world", 100, 5)?;
    let outcome = handle.wait().await?;

    assert_eq!(outcome.batch_size, 1);
    assert_eq!(outcome.tokens_produced, 100);
    // Prefill 100/1024s plus decode 100/128s at batch size 1.
    assert_relative_eq!(
        outcome.latency.as_secs_f64(),
        100.0 / 1024.0 + 100.0 / 128.0,
        epsilon = 1e-6
    );

    // 100 tokens left the bucket; allow a little real-time refill drift.
    let status = engine.tenant_status("tenant_a")?;
    assert!(
        status.tokens >= 900.0 && status.tokens <= 960.0,
        "bucket at {} after one 100-token admit",
        status.tokens
    );
    engine.shutdown().await;
    Ok(())
}

// S2: back-to-back submissions against a tight bucket.
#[tokio::test(start_paused = true)]
async fn s2_rate_limit_rejects_third_request() {
    let engine = default_engine();
    engine.register_tenant("tenant_b", 10.0, 10.0);

    let first = engine.submit("tenant_b", "p", 5, 5);
    let second = engine.submit("tenant_b", "p", 5, 5);
    let third = engine.submit("tenant_b", "p", 5, 5);

    assert!(first.is_ok());
    assert!(second.is_ok());
    match third {
        Err(SubmitError::RateLimited { retry_after }) => {
            assert!(retry_after > Duration::ZERO);
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
    engine.shutdown().await;
}

// S3: fresh arrivals pop in bid order.
#[test]
fn s3_priority_ordering_just_after_arrival() {
    let base = Instant::now();
    let mut queue = AgedPriorityQueue::new(1.0, 64);

    let (r1, _h1) = QueuedRequest::new("t", "p", 100, 1, base);
    let (r2, _h2) = QueuedRequest::new("t", "p", 100, 10, base + Duration::from_millis(1));
    let r2_id = r2.request_id;
    queue.push(r1, base);
    queue.push(r2, base + Duration::from_millis(1));

    let now = base + Duration::from_millis(2);
    assert_eq!(queue.pop(now).unwrap().request_id, r2_id);
}

// S4: twenty seconds of waiting beats a nine-point bid gap.
#[test]
fn s4_aging_wins_over_bid() {
    let base = Instant::now();
    let mut queue = AgedPriorityQueue::new(1.0, 64);

    let (r1, _h1) = QueuedRequest::new("t", "p", 100, 1, base);
    let r1_id = r1.request_id;
    queue.push(r1, base);

    let arrival2 = base + Duration::from_secs(20);
    let (r2, _h2) = QueuedRequest::new("t", "p", 100, 10, arrival2);
    queue.push(r2, arrival2);

    // P_eff(r1) = -(1 + 20) beats P_eff(r2) = -10.
    assert_eq!(queue.pop(arrival2).unwrap().request_id, r1_id);
}

// S5: chaotic arrivals push entropy toward log2(window) and shrink the
// batching window.
#[test]
fn s5_entropy_shrinks_window() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut meter = ArrivalEntropyMeter::new(50);

    let mut now = Instant::now();
    meter.record(now);
    for _ in 0..50 {
        now += Duration::from_millis(rng.random_range(1..=50));
        meter.record(now);
    }

    // The idealized bound is log2(50) = 5.64; birthday collisions among 50
    // random bins shave a fraction of a bit off.
    let entropy = meter.entropy();
    assert!(
        entropy > 4.0 && entropy <= 50f64.log2(),
        "entropy {entropy} outside expected band"
    );

    let window = adaptive_window(Duration::from_millis(10), entropy, 5.0);
    assert_relative_eq!(
        window.as_secs_f64(),
        0.010 * (-entropy / 5.0).exp(),
        epsilon = 1e-9
    );
    assert!(
        window < Duration::from_millis(5),
        "high entropy should roughly halve the window, got {window:?}"
    );
}

// S6: KV budget caps a batch at 16 requests of 2000 tokens; the rest ride
// the next dispatch.
#[tokio::test(start_paused = true)]
async fn s6_kv_bound_splits_batches() {
    let engine = default_engine();
    engine.register_tenant("tenant_a", 1e6, 1e6);

    let mut handles = Vec::new();
    for _ in 0..20 {
        handles.push(engine.submit("tenant_a", "p", 2000, 5).unwrap());
    }

    let mut batch_sizes = Vec::new();
    for handle in handles {
        let outcome = handle.wait().await.expect("request should complete");
        batch_sizes.push(outcome.batch_size);
    }

    // Same bid throughout, so FIFO by seq: first 16 share one batch, the
    // remaining 4 the next.
    assert_eq!(&batch_sizes[..16], &[16; 16]);
    assert_eq!(&batch_sizes[16..], &[4; 4]);

    let snapshot = engine.metrics_snapshot();
    assert_eq!(snapshot.total_batches, 2);
    assert_relative_eq!(snapshot.avg_batch_size, 10.0);
    assert_eq!(snapshot.total_tokens_produced, 40_000);
    engine.shutdown().await;
}

// Fairness and cost metrics across two even tenants.
#[tokio::test(start_paused = true)]
async fn metrics_reflect_even_tenants() {
    let engine = default_engine();
    engine.register_tenant("tenant_a", 1e6, 1e6);
    engine.register_tenant("tenant_b", 1e6, 1e6);

    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(engine.submit("tenant_a", "p", 500, 5).unwrap());
        handles.push(engine.submit("tenant_b", "p", 500, 5).unwrap());
    }
    for handle in handles {
        handle.wait().await.expect("request should complete");
    }

    let snapshot = engine.metrics_snapshot();
    assert_relative_eq!(snapshot.jain_fairness, 1.0, epsilon = 1e-12);
    assert_eq!(snapshot.accepted_requests, 8);
    assert_eq!(snapshot.rejected_requests, 0);
    assert_eq!(snapshot.total_tokens_produced, 4000);
    if snapshot.throughput_tps > 0.0 {
        assert_relative_eq!(
            snapshot.cost_per_mtoken,
            (3.0 / 3600.0) / snapshot.throughput_tps * 1e6,
            epsilon = 1e-6
        );
    }
    engine.shutdown().await;
}

// Shutdown with work still queued resolves every handle.
#[tokio::test(start_paused = true)]
async fn shutdown_leaves_no_dangling_handles() {
    let args = EngineArgs::builder().max_batch(1).build().unwrap();
    let engine = Engine::with_simulated_gpu(args);
    engine.register_tenant("tenant_a", 1e6, 1e6);

    let mut handles = Vec::new();
    for _ in 0..5 {
        handles.push(engine.submit("tenant_a", "p", 10_000, 5).unwrap());
    }
    // Give the worker a window to start the first batch, then stop.
    tokio::time::sleep(Duration::from_millis(15)).await;
    engine.shutdown().await;

    let mut completed = 0;
    let mut shut_down = 0;
    for handle in handles {
        match handle.wait().await {
            Ok(_) => completed += 1,
            Err(gantry_engine::DispatchError::Shutdown) => shut_down += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(completed + shut_down, 5);
    assert!(shut_down >= 1, "at least the tail of the queue saw shutdown");
}
