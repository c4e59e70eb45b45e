// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the Stratus control plane.
//!
//! [`ControlPlaneRuntime`] wires the core services onto one persistence
//! layer and runs the background workers, so the control plane can be
//! hosted inside an existing tokio application (an HTTP front end, a test
//! harness) instead of the standalone binary.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stratus_core::persistence::SqlitePersistence;
//! use stratus_server::runtime::ControlPlaneRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path("stratus.db").await?);
//!
//!     let runtime = ControlPlaneRuntime::builder()
//!         .persistence(persistence)
//!         .gateway(my_github_gateway)
//!         .webhook_base_url("https://stratus.example.com")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let runner = runtime.registry().register(opts, None).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use stratus_core::net::OutboundIp;
use stratus_core::persistence::Persistence;
use stratus_core::runner::RunnerRegistry;
use stratus_core::state_version::StateVersionService;
use stratus_core::vcs::VcsGateway;
use stratus_core::workspace::{ConnectorConfig, WorkspaceConnector};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::runner_monitor::{RunnerMonitor, RunnerMonitorConfig};

/// Builder for creating a [`ControlPlaneRuntime`].
pub struct ControlPlaneRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    gateway: Option<Arc<dyn VcsGateway>>,
    outbound_ip: Option<Arc<dyn OutboundIp>>,
    webhook_base_url: Option<String>,
    vcs_timeout: Duration,
    monitor_config: RunnerMonitorConfig,
    shutdown_timeout: Duration,
}

impl Default for ControlPlaneRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            gateway: None,
            outbound_ip: None,
            webhook_base_url: None,
            vcs_timeout: Duration::from_secs(30),
            monitor_config: RunnerMonitorConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ControlPlaneRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder preloaded with the timeouts and webhook URL from `config`.
    pub fn from_config(config: &Config) -> Self {
        let builder = Self::new()
            .vcs_timeout(config.vcs_timeout)
            .monitor_config(RunnerMonitorConfig {
                poll_interval: config.runner_monitor_interval,
                ping_timeout: config.runner_ping_timeout,
                unknown_timeout: config.runner_unknown_timeout,
            });
        match &config.webhook_base_url {
            Some(url) => builder.webhook_base_url(url),
            None => builder,
        }
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the VCS gateway.
    ///
    /// Without one the runtime has no [`WorkspaceConnector`]. When set, a
    /// webhook base URL is required.
    pub fn gateway(mut self, gateway: Arc<dyn VcsGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the resolver used for runners that register without an address.
    ///
    /// Default: UDP probe of the host's outbound interface
    pub fn outbound_ip(mut self, outbound_ip: Arc<dyn OutboundIp>) -> Self {
        self.outbound_ip = Some(outbound_ip);
        self
    }

    /// Set the public base URL used in webhook callback URLs.
    pub fn webhook_base_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_base_url = Some(url.into());
        self
    }

    /// Set the bound on each VCS provider call.
    ///
    /// Default: 30 seconds
    pub fn vcs_timeout(mut self, timeout: Duration) -> Self {
        self.vcs_timeout = timeout;
        self
    }

    /// Set the runner monitor configuration.
    pub fn monitor_config(mut self, config: RunnerMonitorConfig) -> Self {
        self.monitor_config = config;
        self
    }

    /// Set how long [`ControlPlaneRuntime::shutdown`] waits for workers.
    ///
    /// Default: 10 seconds
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ControlPlaneRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;

        let connector = match self.gateway {
            Some(gateway) => {
                let base = self
                    .webhook_base_url
                    .ok_or_else(|| anyhow::anyhow!("webhook_base_url is required with a gateway"))?;
                Some((
                    gateway,
                    ConnectorConfig {
                        webhook_base_url: base,
                        gateway_timeout: self.vcs_timeout,
                    },
                ))
            }
            None => None,
        };

        if self.monitor_config.poll_interval.is_zero() {
            anyhow::bail!("runner monitor poll interval must be positive");
        }

        Ok(ControlPlaneRuntimeConfig {
            persistence,
            connector,
            outbound_ip: self.outbound_ip,
            monitor_config: self.monitor_config,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// Configuration for a [`ControlPlaneRuntime`].
pub struct ControlPlaneRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    connector: Option<(Arc<dyn VcsGateway>, ConnectorConfig)>,
    outbound_ip: Option<Arc<dyn OutboundIp>>,
    monitor_config: RunnerMonitorConfig,
    shutdown_timeout: Duration,
}

impl ControlPlaneRuntimeConfig {
    /// Start the runtime, spawning the runner monitor.
    pub async fn start(self) -> Result<ControlPlaneRuntime> {
        let registry = match self.outbound_ip {
            Some(outbound_ip) => {
                RunnerRegistry::with_outbound_ip(self.persistence.clone(), outbound_ip)
            }
            None => RunnerRegistry::new(self.persistence.clone()),
        };

        let connector = self.connector.map(|(gateway, config)| {
            WorkspaceConnector::new(self.persistence.clone(), gateway, config)
        });
        if connector.is_none() {
            debug!("No VCS gateway configured; workspace connections are disabled");
        }

        let state_versions = StateVersionService::new(self.persistence.clone());

        let monitor = RunnerMonitor::new(registry.clone(), self.monitor_config);
        let monitor_shutdown = monitor.shutdown_handle();
        let monitor_handle = tokio::spawn(async move {
            monitor.run().await;
        });

        info!(
            workspace_connections = connector.is_some(),
            "ControlPlaneRuntime started"
        );

        Ok(ControlPlaneRuntime {
            registry,
            connector,
            state_versions,
            monitor_handle,
            monitor_shutdown,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// A running control plane that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ControlPlaneRuntime {
    registry: RunnerRegistry,
    connector: Option<WorkspaceConnector>,
    state_versions: StateVersionService,
    monitor_handle: JoinHandle<()>,
    monitor_shutdown: Arc<Notify>,
    shutdown_timeout: Duration,
}

impl ControlPlaneRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ControlPlaneRuntimeBuilder {
        ControlPlaneRuntimeBuilder::new()
    }

    /// The runner registry.
    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    /// The workspace connector, if a gateway was configured.
    pub fn connector(&self) -> Option<&WorkspaceConnector> {
        self.connector.as_ref()
    }

    /// The state version service.
    pub fn state_versions(&self) -> &StateVersionService {
        &self.state_versions
    }

    /// Check if the background workers are still running.
    pub fn is_running(&self) -> bool {
        !self.monitor_handle.is_finished()
    }

    /// Gracefully shut down the runtime, waiting at most the configured
    /// shutdown timeout for workers to stop.
    pub async fn shutdown(self) -> Result<()> {
        info!("ControlPlaneRuntime shutting down...");

        self.monitor_shutdown.notify_one();

        match tokio::time::timeout(self.shutdown_timeout, self.monitor_handle).await {
            Ok(Ok(())) => {
                info!("ControlPlaneRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Runner monitor task panicked: {}", e);
                Err(anyhow::anyhow!("runner monitor task panicked: {}", e))
            }
            Err(_) => {
                error!(
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "Runner monitor did not stop in time"
                );
                Err(anyhow::anyhow!("runner monitor did not stop in time"))
            }
        }
    }
}
