// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for detecting runners that stopped reporting.
//!
//! Runners ping the control plane while they are alive. A runner that is
//! idle or busy but has not pinged within the ping timeout is moved to
//! `unknown`; one that has stayed `unknown` past the unknown timeout is
//! given up on and moved to `errored`. Both moves go through the registry,
//! so a runner that exits concurrently keeps its terminal status.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use stratus_core::clock::current_timestamp;
use stratus_core::error::{Error, ErrorKind, Result};
use stratus_core::runner::{RunnerListOptions, RunnerMeta, RunnerRegistry, RunnerStatus};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Configuration for the runner monitor.
#[derive(Debug, Clone)]
pub struct RunnerMonitorConfig {
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Maximum time since the last ping before an idle or busy runner is
    /// marked unknown.
    pub ping_timeout: Duration,
    /// Maximum time in unknown before the runner is marked errored.
    pub unknown_timeout: Duration,
}

impl Default for RunnerMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(30),
            unknown_timeout: Duration::from_secs(300),
        }
    }
}

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Runners moved to unknown.
    pub marked_unknown: usize,
    /// Runners moved to errored.
    pub marked_errored: usize,
}

/// Background worker that demotes silent runners.
pub struct RunnerMonitor {
    registry: RunnerRegistry,
    config: RunnerMonitorConfig,
    shutdown: Arc<Notify>,
}

impl RunnerMonitor {
    /// Create a new runner monitor.
    pub fn new(registry: RunnerRegistry, config: RunnerMonitorConfig) -> Self {
        Self {
            registry,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            ping_timeout_secs = self.config.ping_timeout.as_secs(),
            unknown_timeout_secs = self.config.unknown_timeout.as_secs(),
            "Runner monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Runner monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Runner monitor sweep failed");
                    }
                }
            }
        }

        info!("Runner monitor stopped");
    }

    /// Sweep once, judging staleness against the current time.
    pub async fn sweep(&self) -> Result<SweepOutcome> {
        self.sweep_at(current_timestamp()).await
    }

    /// Sweep once, judging staleness against `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepOutcome> {
        let ping_cutoff = now - to_chrono(self.config.ping_timeout)?;
        let unknown_cutoff = now - to_chrono(self.config.unknown_timeout)?;

        let runners = self.registry.list(&RunnerListOptions::default()).await?;
        let mut outcome = SweepOutcome::default();

        for runner in runners {
            let target = match runner.status {
                RunnerStatus::Idle | RunnerStatus::Busy if runner.last_ping_at < ping_cutoff => {
                    RunnerStatus::Unknown
                }
                RunnerStatus::Unknown if runner.last_status_at < unknown_cutoff => {
                    RunnerStatus::Errored
                }
                _ => continue,
            };

            match self.demote(&runner, target).await {
                Ok(()) if target == RunnerStatus::Unknown => outcome.marked_unknown += 1,
                Ok(()) => outcome.marked_errored += 1,
                Err(e) if e.kind() == ErrorKind::Conflict => {
                    debug!(runner_id = %runner.id, error = %e, "runner changed during sweep; skipped");
                }
                Err(e) => {
                    error!(runner_id = %runner.id, error = %e, "Failed to update stale runner");
                }
            }
        }

        if outcome == SweepOutcome::default() {
            debug!("No stale runners found");
        } else {
            info!(
                marked_unknown = outcome.marked_unknown,
                marked_errored = outcome.marked_errored,
                "Runner monitor sweep complete"
            );
        }
        Ok(outcome)
    }

    async fn demote(&self, runner: &RunnerMeta, target: RunnerStatus) -> Result<()> {
        warn!(
            runner_id = %runner.id,
            from = %runner.status,
            to = %target,
            last_ping_at = %runner.last_ping_at,
            last_status_at = %runner.last_status_at,
            "Demoting silent runner"
        );
        self.registry.set_status(&runner.id, target, false).await?;
        Ok(())
    }
}

fn to_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|e| Error::Validation(format!("invalid duration: {e}")))
}
