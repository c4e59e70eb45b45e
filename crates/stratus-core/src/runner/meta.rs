// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner records and the runner status state machine.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::current_timestamp;
use crate::error::{Error, Result};
use crate::ids::{RUNNER_PREFIX, new_id};

/// Status of a runner.
///
/// ```text
///   idle    ─┐
///   busy    ─┼──► any status
///   unknown ─┘
///   errored   (terminal)
///   exited    (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    /// Registered and waiting for work.
    Idle,
    /// Executing at least one job.
    Busy,
    /// Stopped pinging; may come back.
    Unknown,
    /// Failed; will not come back.
    Errored,
    /// Shut down cleanly.
    Exited,
}

impl RunnerStatus {
    /// All statuses, in declaration order.
    pub const ALL: [RunnerStatus; 5] = [
        Self::Idle,
        Self::Busy,
        Self::Unknown,
        Self::Errored,
        Self::Exited,
    ];

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Unknown => "unknown",
            Self::Errored => "errored",
            Self::Exited => "exited",
        }
    }

    /// Whether no transition out of this status is permitted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Errored | Self::Exited)
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "unknown" => Ok(Self::Unknown),
            "errored" => Ok(Self::Errored),
            "exited" => Ok(Self::Exited),
            other => Err(Error::Corruption(format!("unknown runner status: {other}"))),
        }
    }
}

/// Decide whether a runner may move from `current` to `requested`.
///
/// Pure function of the two statuses; storage plays no part.
pub fn check_transition(current: RunnerStatus, requested: RunnerStatus) -> Result<()> {
    if current.is_terminal() {
        return Err(Error::Conflict(format!(
            "runner status {current} is final; cannot transition to {requested}"
        )));
    }
    Ok(())
}

/// Agent pool a runner registered through. Only agents have one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerAgentPool {
    /// ID of the agent pool.
    pub id: String,
    /// Name of the agent pool.
    pub name: String,
    /// Organization owning the pool.
    pub organization_name: String,
    /// ID of the agent token used to register.
    pub token_id: String,
}

/// A registered runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerMeta {
    /// Unique runner ID.
    pub id: String,
    /// Optional descriptive name.
    pub name: Option<String>,
    /// Version of the runner software.
    pub version: String,
    /// Current status.
    pub status: RunnerStatus,
    /// Maximum number of jobs the runner can execute concurrently.
    pub max_jobs: i32,
    /// Number of jobs currently allocated to the runner.
    pub current_jobs: i32,
    /// Last time a ping was received.
    pub last_ping_at: DateTime<Utc>,
    /// Last time the status changed.
    pub last_status_at: DateTime<Utc>,
    /// IP address of the runner.
    pub ip_address: IpAddr,
    /// Set for agent runners, `None` for runners embedded in the server.
    pub agent_pool: Option<RunnerAgentPool>,
}

/// Options a runner supplies when registering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterOptions {
    /// Descriptive name.
    #[serde(default)]
    pub name: Option<String>,
    /// Version of the runner software.
    pub version: String,
    /// Number of jobs the runner can handle at any one time.
    pub concurrency: i32,
    /// IP address of the runner. Determined by the caller, not sent over the
    /// wire.
    #[serde(skip)]
    pub ip_address: Option<IpAddr>,
    /// Jobs the runner found left over from a previous process.
    #[serde(default, rename = "current-jobs", skip_serializing_if = "Vec::is_empty")]
    pub current_jobs: Vec<String>,
}

impl RunnerMeta {
    /// Build the record for a newly registered runner.
    ///
    /// `ip_address` must already be resolved. The runner starts out idle with
    /// both timestamps set to now.
    pub fn register(
        opts: &RegisterOptions,
        agent_pool: Option<RunnerAgentPool>,
        ip_address: IpAddr,
    ) -> Result<Self> {
        let now = current_timestamp();
        let mut meta = Self {
            id: new_id(RUNNER_PREFIX),
            name: opts.name.clone().filter(|n| !n.is_empty()),
            version: opts.version.clone(),
            // Placeholder until the transition below; a fresh record is never
            // in a terminal state.
            status: RunnerStatus::Unknown,
            max_jobs: opts.concurrency,
            current_jobs: 0,
            last_ping_at: now,
            last_status_at: now,
            ip_address,
            agent_pool,
        };
        meta.set_status(RunnerStatus::Idle, true)?;
        Ok(meta)
    }

    /// Apply a status transition.
    ///
    /// Fails with [`Error::Conflict`] and leaves the record untouched if the
    /// current status is terminal. Otherwise sets the status and the status
    /// timestamp, and the ping timestamp too when `update_ping` is set.
    pub fn set_status(&mut self, status: RunnerStatus, update_ping: bool) -> Result<()> {
        check_transition(self.status, status)?;
        let now = current_timestamp();
        self.status = status;
        self.last_status_at = now;
        if update_ping {
            self.last_ping_at = now;
        }
        Ok(())
    }

    /// Whether the runner is an agent (runs outside the server process).
    pub fn is_agent(&self) -> bool {
        self.agent_pool.is_some()
    }
}

impl fmt::Display for RunnerMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn runner_with_status(status: RunnerStatus) -> RunnerMeta {
        let mut meta = RunnerMeta::register(
            &RegisterOptions {
                version: "0.1.0".into(),
                concurrency: 5,
                ..Default::default()
            },
            None,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        )
        .unwrap();
        meta.status = status;
        meta
    }

    #[test]
    fn test_register_starts_idle() {
        let meta = runner_with_status(RunnerStatus::Idle);
        assert_eq!(meta.status, RunnerStatus::Idle);
        assert_eq!(meta.last_ping_at, meta.last_status_at);
        assert_eq!(meta.max_jobs, 5);
        assert_eq!(meta.current_jobs, 0);
        assert!(!meta.is_agent());
    }

    #[test]
    fn test_terminal_states_reject_every_transition() {
        for from in [RunnerStatus::Errored, RunnerStatus::Exited] {
            for to in RunnerStatus::ALL {
                let mut meta = runner_with_status(from);
                let before = meta.clone();
                let err = meta.set_status(to, true).unwrap_err();
                assert!(matches!(err, Error::Conflict(_)), "{from} -> {to}");
                assert_eq!(meta, before, "record modified on rejected {from} -> {to}");
            }
        }
    }

    #[test]
    fn test_non_terminal_states_accept_every_transition() {
        for from in [RunnerStatus::Idle, RunnerStatus::Busy, RunnerStatus::Unknown] {
            for to in RunnerStatus::ALL {
                let mut meta = runner_with_status(from);
                let ping_before = meta.last_ping_at;
                let called_at = current_timestamp();
                meta.set_status(to, false).unwrap();
                assert_eq!(meta.status, to);
                assert!(meta.last_status_at >= called_at);
                assert_eq!(meta.last_ping_at, ping_before, "ping updated without request");

                let mut meta = runner_with_status(from);
                meta.set_status(to, true).unwrap();
                assert_eq!(meta.last_ping_at, meta.last_status_at);
            }
        }
    }

    #[test]
    fn test_check_transition_is_independent_of_records() {
        assert!(check_transition(RunnerStatus::Busy, RunnerStatus::Exited).is_ok());
        assert!(check_transition(RunnerStatus::Exited, RunnerStatus::Idle).is_err());
    }

    #[test]
    fn test_status_round_trips_through_storage_form() {
        for status in RunnerStatus::ALL {
            assert_eq!(status.as_str().parse::<RunnerStatus>().unwrap(), status);
        }
        assert!(matches!(
            "running".parse::<RunnerStatus>(),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_register_options_deserialize_leftover_jobs() {
        let opts: RegisterOptions = serde_json::from_str(
            r#"{"version":"1.2.0","concurrency":3,"current-jobs":["job-a","job-b"]}"#,
        )
        .unwrap();
        assert_eq!(opts.current_jobs, vec!["job-a", "job-b"]);
        assert!(opts.ip_address.is_none());
    }
}
