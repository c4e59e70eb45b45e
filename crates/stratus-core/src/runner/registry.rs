// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner registration, status reporting and capacity bookkeeping.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::current_timestamp;
use crate::error::{Error, Result};
use crate::net::{OutboundIp, UdpOutboundIp};
use crate::persistence::Persistence;

use super::meta::{RegisterOptions, RunnerAgentPool, RunnerMeta, RunnerStatus};

/// Attempts at a status compare-and-swap before giving up with
/// [`Error::Conflict`].
pub const MAX_STATUS_RETRIES: usize = 5;

/// Filter for [`RunnerRegistry::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerListOptions {
    /// Only agents whose pool belongs to this organization.
    #[serde(default)]
    pub organization: Option<String>,
    /// Only agents in this pool.
    #[serde(default)]
    pub pool_id: Option<String>,
}

/// Service owning runner records.
///
/// Status changes go through [`RunnerMeta::set_status`] and are stored with a
/// compare-and-swap on the status and status timestamp that were read, so two
/// concurrent transitions of one runner cannot interleave: the loser reloads
/// and has its transition re-checked against the winner's result.
#[derive(Clone)]
pub struct RunnerRegistry {
    persistence: Arc<dyn Persistence>,
    outbound_ip: Arc<dyn OutboundIp>,
}

impl RunnerRegistry {
    /// Registry resolving runner addresses with [`UdpOutboundIp`].
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self::with_outbound_ip(persistence, Arc::new(UdpOutboundIp::default()))
    }

    /// Registry with a custom outbound-IP resolver.
    pub fn with_outbound_ip(
        persistence: Arc<dyn Persistence>,
        outbound_ip: Arc<dyn OutboundIp>,
    ) -> Self {
        Self {
            persistence,
            outbound_ip,
        }
    }

    /// Register a new runner.
    ///
    /// `agent_pool` is resolved by the caller from the agent token and is
    /// `None` for runners embedded in the server.
    pub async fn register(
        &self,
        opts: RegisterOptions,
        agent_pool: Option<RunnerAgentPool>,
    ) -> Result<RunnerMeta> {
        let ip_address = match opts.ip_address {
            Some(ip) => ip,
            None => self.resolve_ip().await,
        };
        let runner = RunnerMeta::register(&opts, agent_pool, ip_address)?;

        if !opts.current_jobs.is_empty() {
            // Not reconciled against job records; reported for operators.
            warn!(
                runner_id = %runner.id,
                jobs = ?opts.current_jobs,
                "runner registered with leftover jobs"
            );
        }

        self.persistence.insert_runner(&runner).await?;

        info!(
            runner_id = %runner.id,
            name = runner.name.as_deref().unwrap_or_default(),
            version = %runner.version,
            ip_address = %runner.ip_address,
            max_jobs = runner.max_jobs,
            pool = runner.agent_pool.as_ref().map(|p| p.id.as_str()).unwrap_or_default(),
            "registered runner"
        );
        Ok(runner)
    }

    async fn resolve_ip(&self) -> IpAddr {
        match self.outbound_ip.resolve().await {
            Ok(ip) => ip,
            Err(e) => {
                debug!(error = %e, "outbound ip lookup failed; using loopback");
                IpAddr::V6(Ipv6Addr::LOCALHOST)
            }
        }
    }

    /// Fetch a runner.
    pub async fn get(&self, id: &str) -> Result<RunnerMeta> {
        self.persistence
            .get_runner(id)
            .await?
            .ok_or_else(|| Error::not_found("runner", id))
    }

    /// List runners.
    pub async fn list(&self, opts: &RunnerListOptions) -> Result<Vec<RunnerMeta>> {
        self.persistence.list_runners(opts).await
    }

    /// Transition a runner to `status`, also refreshing its ping timestamp
    /// if `update_ping` is set.
    ///
    /// Fails with [`Error::Conflict`] if the runner is in a terminal status,
    /// or if it kept changing underneath us for [`MAX_STATUS_RETRIES`]
    /// attempts.
    pub async fn set_status(
        &self,
        id: &str,
        status: RunnerStatus,
        update_ping: bool,
    ) -> Result<RunnerMeta> {
        for attempt in 1..=MAX_STATUS_RETRIES {
            let current = self.get(id).await?;
            let mut updated = current.clone();
            updated.set_status(status, update_ping)?;

            if let Some(stored) = self
                .persistence
                .compare_and_set_runner_status(
                    &updated,
                    update_ping,
                    current.status,
                    current.last_status_at,
                )
                .await?
            {
                if current.status != status {
                    info!(
                        runner_id = %id,
                        from = %current.status,
                        to = %status,
                        "runner status changed"
                    );
                }
                return Ok(stored);
            }

            debug!(runner_id = %id, attempt, "runner changed concurrently; retrying status update");
        }

        Err(Error::Conflict(format!(
            "runner {id} changed concurrently {MAX_STATUS_RETRIES} times"
        )))
    }

    /// Record a ping. Only `last_ping_at` changes; the status is left alone
    /// whatever it is.
    pub async fn ping(&self, id: &str) -> Result<RunnerMeta> {
        if !self
            .persistence
            .update_runner_ping(id, current_timestamp())
            .await?
        {
            return Err(Error::not_found("runner", id));
        }
        self.get(id).await
    }

    /// Add `delta` (possibly negative) to the runner's allocated job count,
    /// returning the new count.
    ///
    /// The count is not checked against `max_jobs`; admission is the
    /// caller's job.
    pub async fn adjust_current_jobs(&self, id: &str, delta: i32) -> Result<i32> {
        let current = self
            .persistence
            .adjust_runner_jobs(id, delta)
            .await?
            .ok_or_else(|| Error::not_found("runner", id))?;
        debug!(runner_id = %id, delta, current_jobs = current, "adjusted runner jobs");
        Ok(current)
    }
}
