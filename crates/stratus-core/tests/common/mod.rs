// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stratus-core integration tests.
//!
//! Every context runs against a private in-memory SQLite database and a
//! [`MockGateway`].

#![allow(dead_code)]

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use stratus_core::net::OutboundIp;
use stratus_core::persistence::{Persistence, SqlitePersistence};
use stratus_core::runner::RunnerRegistry;
use stratus_core::state_version::StateVersionService;
use stratus_core::vcs::MockGateway;
use stratus_core::workspace::{ConnectOptions, ConnectorConfig, WorkspaceConnector};

pub const WEBHOOK_BASE_URL: &str = "https://stratus.test";

/// Services wired to one database and one mock gateway.
pub struct TestContext {
    pub db: SqlitePersistence,
    pub gateway: Arc<MockGateway>,
    pub registry: RunnerRegistry,
    pub connector: WorkspaceConnector,
    pub state_versions: StateVersionService,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_gateway_timeout(Duration::from_secs(10)).await
    }

    pub async fn with_gateway_timeout(gateway_timeout: Duration) -> Self {
        let db = SqlitePersistence::in_memory()
            .await
            .expect("Failed to create in-memory database");
        let persistence: Arc<dyn Persistence> = Arc::new(db.clone());
        let gateway = Arc::new(MockGateway::new());

        let connector = WorkspaceConnector::new(
            persistence.clone(),
            gateway.clone(),
            ConnectorConfig {
                webhook_base_url: WEBHOOK_BASE_URL.to_string(),
                gateway_timeout,
            },
        );

        Self {
            registry: RunnerRegistry::with_outbound_ip(
                persistence.clone(),
                Arc::new(FixedIp("10.0.0.7".parse().expect("valid ip"))),
            ),
            state_versions: StateVersionService::new(persistence),
            connector,
            gateway,
            db,
        }
    }

    pub async fn webhook_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM webhooks")
            .fetch_one(self.db.pool())
            .await
            .expect("Failed to count webhooks")
    }

    pub async fn link_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM workspace_repos")
            .fetch_one(self.db.pool())
            .await
            .expect("Failed to count workspace repos")
    }
}

/// Connect options for `identifier` on the default test provider.
pub fn connect_opts(identifier: &str) -> ConnectOptions {
    ConnectOptions {
        identifier: identifier.to_string(),
        vcs_provider_id: "vcs-github".to_string(),
        cloud: "github".to_string(),
        branch: None,
    }
}

/// Resolver that always returns the same address.
pub struct FixedIp(pub IpAddr);

#[async_trait]
impl OutboundIp for FixedIp {
    async fn resolve(&self) -> io::Result<IpAddr> {
        Ok(self.0)
    }
}

/// Resolver that always fails, as on a host without a route out.
pub struct NoRoute;

#[async_trait]
impl OutboundIp for NoRoute {
    async fn resolve(&self) -> io::Result<IpAddr> {
        Err(io::Error::new(io::ErrorKind::NetworkUnreachable, "no route"))
    }
}
