// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for runner_monitor - demoting runners that stopped pinging.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use stratus_core::persistence::SqlitePersistence;
use stratus_core::runner::{RegisterOptions, RunnerRegistry, RunnerStatus};
use stratus_server::runner_monitor::{RunnerMonitor, RunnerMonitorConfig, SweepOutcome};

async fn test_registry() -> RunnerRegistry {
    let db = SqlitePersistence::in_memory()
        .await
        .expect("Failed to create in-memory database");
    RunnerRegistry::new(Arc::new(db))
}

fn register_opts() -> RegisterOptions {
    RegisterOptions {
        version: "0.9.0".into(),
        concurrency: 1,
        ip_address: Some(IpAddr::V4(Ipv4Addr::new(10, 1, 0, 1))),
        ..Default::default()
    }
}

fn config() -> RunnerMonitorConfig {
    RunnerMonitorConfig {
        poll_interval: Duration::from_secs(10),
        ping_timeout: Duration::from_secs(30),
        unknown_timeout: Duration::from_secs(300),
    }
}

#[tokio::test]
async fn test_fresh_runners_are_left_alone() {
    let registry = test_registry().await;
    let runner = registry.register(register_opts(), None).await.unwrap();
    let monitor = RunnerMonitor::new(registry.clone(), config());

    let outcome = monitor
        .sweep_at(Utc::now() + ChronoDuration::seconds(5))
        .await
        .unwrap();
    assert_eq!(outcome, SweepOutcome::default());
    assert_eq!(registry.get(&runner.id).await.unwrap().status, RunnerStatus::Idle);
}

#[tokio::test]
async fn test_silent_runner_goes_unknown_then_errored() {
    let registry = test_registry().await;
    let idle = registry.register(register_opts(), None).await.unwrap();
    let busy = registry.register(register_opts(), None).await.unwrap();
    registry
        .set_status(&busy.id, RunnerStatus::Busy, true)
        .await
        .unwrap();
    let exited = registry.register(register_opts(), None).await.unwrap();
    let exited = registry
        .set_status(&exited.id, RunnerStatus::Exited, false)
        .await
        .unwrap();
    let monitor = RunnerMonitor::new(registry.clone(), config());

    let outcome = monitor
        .sweep_at(Utc::now() + ChronoDuration::seconds(60))
        .await
        .unwrap();
    assert_eq!(outcome.marked_unknown, 2);
    assert_eq!(outcome.marked_errored, 0);

    let unknown = registry.get(&idle.id).await.unwrap();
    assert_eq!(unknown.status, RunnerStatus::Unknown);
    // Demotion is not a sign of life.
    assert_eq!(unknown.last_ping_at, idle.last_ping_at);
    assert_eq!(registry.get(&busy.id).await.unwrap().status, RunnerStatus::Unknown);
    assert_eq!(registry.get(&exited.id).await.unwrap(), exited);

    // Just went unknown, so not yet errored.
    let outcome = monitor
        .sweep_at(Utc::now() + ChronoDuration::seconds(60))
        .await
        .unwrap();
    assert_eq!(outcome, SweepOutcome::default());

    let outcome = monitor
        .sweep_at(Utc::now() + ChronoDuration::seconds(400))
        .await
        .unwrap();
    assert_eq!(outcome.marked_errored, 2);
    assert_eq!(registry.get(&idle.id).await.unwrap().status, RunnerStatus::Errored);
    assert_eq!(registry.get(&busy.id).await.unwrap().status, RunnerStatus::Errored);
    assert_eq!(registry.get(&exited.id).await.unwrap(), exited);

    // Terminal now; nothing further to do.
    let outcome = monitor
        .sweep_at(Utc::now() + ChronoDuration::seconds(4000))
        .await
        .unwrap();
    assert_eq!(outcome, SweepOutcome::default());
}

#[tokio::test]
async fn test_run_loop_sweeps_and_stops_on_shutdown() {
    let registry = test_registry().await;
    let runner = registry.register(register_opts(), None).await.unwrap();
    let monitor = RunnerMonitor::new(
        registry.clone(),
        RunnerMonitorConfig {
            poll_interval: Duration::from_millis(20),
            ping_timeout: Duration::from_millis(10),
            unknown_timeout: Duration::from_secs(3600),
        },
    );
    let shutdown = monitor.shutdown_handle();
    let handle = tokio::spawn(async move { monitor.run().await });

    let mut status = RunnerStatus::Idle;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = registry.get(&runner.id).await.unwrap().status;
        if status == RunnerStatus::Unknown {
            break;
        }
    }
    assert_eq!(status, RunnerStatus::Unknown);

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("monitor should stop after shutdown")
        .unwrap();
}
