// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for stratus-core.
//!
//! [`Persistence`] covers single-statement operations that need no
//! surrounding transaction. Operations that must span several statements
//! (connecting and disconnecting workspaces) go through a
//! [`StoreTransaction`] obtained from [`Persistence::begin`].
//!
//! Dropping a [`StoreTransaction`] without committing rolls it back. The
//! connector relies on this for cancellation: a connect or disconnect future
//! dropped mid-flight leaves nothing behind locally.

pub mod postgres;
pub mod sqlite;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use crate::error::{Error, Result};
use crate::runner::{RunnerAgentPool, RunnerListOptions, RunnerMeta, RunnerStatus};
use crate::state_version::{StateVersion, StateVersionOutput};
use crate::workspace::{NewWorkspaceRepo, Webhook, WebhookKey, WorkspaceRepo};

pub(crate) const RUNNER_COLUMNS: &str = "\
    id, name, version, status, max_jobs, current_jobs, last_ping_at, last_status_at, \
    ip_address, agent_pool_id, agent_pool_name, organization_name, agent_token_id";

pub(crate) const WEBHOOK_COLUMNS: &str =
    "webhook_id, vcs_id, identifier, vcs_provider_id, cloud, secret, created_at";

pub(crate) const WORKSPACE_REPO_SELECT: &str = "\
    SELECT r.workspace_id, r.branch, r.vcs_provider_id, r.webhook_id, \
           w.identifier, w.cloud, r.created_at \
    FROM workspace_repos r \
    JOIN webhooks w ON w.webhook_id = r.webhook_id";

pub(crate) const STATE_VERSION_COLUMNS: &str =
    "id, seq, workspace_id, serial, lineage, state, run_id, created_at";

pub(crate) const STATE_VERSION_OUTPUT_COLUMNS: &str =
    "id, state_version_id, name, output_type, value, sensitive";

/// Runner row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunnerRecord {
    /// Runner ID.
    pub id: String,
    /// Descriptive name.
    pub name: Option<String>,
    /// Runner software version.
    pub version: String,
    /// Status, lowercase.
    pub status: String,
    /// Concurrency limit.
    pub max_jobs: i32,
    /// Jobs currently allocated.
    pub current_jobs: i32,
    /// Last ping.
    pub last_ping_at: DateTime<Utc>,
    /// Last status change.
    pub last_status_at: DateTime<Utc>,
    /// IP address in textual form.
    pub ip_address: String,
    /// Agent pool ID; `NULL` for server runners.
    pub agent_pool_id: Option<String>,
    /// Agent pool name.
    pub agent_pool_name: Option<String>,
    /// Organization owning the agent pool.
    pub organization_name: Option<String>,
    /// Agent token used to register.
    pub agent_token_id: Option<String>,
}

impl TryFrom<RunnerRecord> for RunnerMeta {
    type Error = Error;

    fn try_from(r: RunnerRecord) -> Result<Self> {
        let status: RunnerStatus = r.status.parse()?;
        let ip_address: IpAddr = r.ip_address.parse().map_err(|_| {
            Error::Corruption(format!("runner {}: invalid ip address {:?}", r.id, r.ip_address))
        })?;
        let agent_pool = match r.agent_pool_id {
            None => None,
            Some(id) => match (r.agent_pool_name, r.organization_name, r.agent_token_id) {
                (Some(name), Some(organization_name), Some(token_id)) => Some(RunnerAgentPool {
                    id,
                    name,
                    organization_name,
                    token_id,
                }),
                _ => {
                    return Err(Error::Corruption(format!(
                        "runner {}: incomplete agent pool {id}",
                        r.id
                    )));
                }
            },
        };
        Ok(RunnerMeta {
            id: r.id,
            name: r.name,
            version: r.version,
            status,
            max_jobs: r.max_jobs,
            current_jobs: r.current_jobs,
            last_ping_at: r.last_ping_at,
            last_status_at: r.last_status_at,
            ip_address,
            agent_pool,
        })
    }
}

/// State version row, without its outputs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StateVersionRecord {
    /// State version ID.
    pub id: String,
    /// Creation sequence.
    pub seq: i64,
    /// Owning workspace.
    pub workspace_id: String,
    /// Serial.
    pub serial: i64,
    /// Lineage.
    pub lineage: Option<String>,
    /// Base64 payload.
    pub state: String,
    /// Producing run.
    pub run_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// State version output row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StateVersionOutputRecord {
    /// Output ID.
    pub id: String,
    /// Owning state version.
    pub state_version_id: String,
    /// Output name.
    pub name: String,
    /// Type expression.
    pub output_type: String,
    /// JSON-encoded value.
    pub value: String,
    /// Sensitive flag.
    pub sensitive: bool,
}

impl TryFrom<StateVersionOutputRecord> for StateVersionOutput {
    type Error = Error;

    fn try_from(r: StateVersionOutputRecord) -> Result<Self> {
        let value = serde_json::from_str(&r.value).map_err(|e| {
            Error::Corruption(format!("state version output {}: {e}", r.id))
        })?;
        Ok(StateVersionOutput {
            id: r.id,
            name: r.name,
            output_type: r.output_type,
            value,
            sensitive: r.sensitive,
        })
    }
}

impl StateVersionRecord {
    /// Attach outputs to build the domain record.
    pub fn into_state_version(
        self,
        outputs: Vec<StateVersionOutputRecord>,
    ) -> Result<StateVersion> {
        let mut outputs = outputs
            .into_iter()
            .map(StateVersionOutput::try_from)
            .collect::<Result<Vec<_>>>()?;
        outputs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(StateVersion {
            id: self.id,
            workspace_id: self.workspace_id,
            serial: self.serial,
            lineage: self.lineage,
            state: self.state,
            run_id: self.run_id,
            created_at: self.created_at,
            seq: self.seq,
            outputs,
        })
    }
}

/// Encode an output value for storage.
pub(crate) fn encode_output_value(output: &StateVersionOutput) -> Result<String> {
    serde_json::to_string(&output.value)
        .map_err(|e| Error::Validation(format!("output {}: {e}", output.name)))
}

/// Map a unique violation to [`Error::Conflict`]; everything else goes
/// through the usual classification.
pub(crate) fn conflict_on_unique(err: sqlx::Error, message: impl FnOnce() -> String) -> Error {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            Error::Conflict(message())
        }
        _ => err.into(),
    }
}

/// Storage for runners, workspace links, webhooks and state versions.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Insert a newly registered runner.
    async fn insert_runner(&self, runner: &RunnerMeta) -> Result<()>;

    /// Fetch a runner.
    async fn get_runner(&self, id: &str) -> Result<Option<RunnerMeta>>;

    /// List runners, ordered by ID.
    async fn list_runners(&self, opts: &RunnerListOptions) -> Result<Vec<RunnerMeta>>;

    /// Store `runner`'s status and status timestamp, but only if the stored
    /// row still has `expected_status` and `expected_status_at`.
    /// `last_ping_at` is written only when `update_ping` is set; otherwise
    /// the stored value is kept, including a ping that landed after `runner`
    /// was read.
    ///
    /// Returns the stored row, or `None` when the row changed in the meantime
    /// (or is gone).
    async fn compare_and_set_runner_status(
        &self,
        runner: &RunnerMeta,
        update_ping: bool,
        expected_status: RunnerStatus,
        expected_status_at: DateTime<Utc>,
    ) -> Result<Option<RunnerMeta>>;

    /// Set `last_ping_at`. Returns `false` if there is no such runner.
    async fn update_runner_ping(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Add `delta` to `current_jobs` atomically, returning the new value, or
    /// `None` if there is no such runner.
    async fn adjust_runner_jobs(&self, id: &str, delta: i32) -> Result<Option<i32>>;

    /// Fetch a workspace link outside any transaction.
    async fn get_workspace_repo(&self, workspace_id: &str) -> Result<Option<WorkspaceRepo>>;

    /// Insert a state version and its outputs atomically, returning it with
    /// `seq` assigned.
    async fn create_state_version(&self, sv: &StateVersion) -> Result<StateVersion>;

    /// Fetch a state version.
    async fn get_state_version(&self, id: &str) -> Result<Option<StateVersion>>;

    /// Fetch the state version with the highest `seq` in a workspace.
    async fn current_state_version(&self, workspace_id: &str) -> Result<Option<StateVersion>>;

    /// A page of state versions, newest first, and the total count.
    async fn list_state_versions(
        &self,
        workspace_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<StateVersion>, i64)>;
}

/// An open transaction.
///
/// Dropping it without calling [`commit`](Self::commit) rolls it back.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Serialize transactions working on the same webhook triple until this
    /// transaction ends.
    async fn lock_webhook_key(&mut self, key: &WebhookKey) -> Result<()>;

    /// Fetch the webhook for a triple.
    async fn get_webhook_by_key(&mut self, key: &WebhookKey) -> Result<Option<Webhook>>;

    /// Fetch a webhook by local ID.
    async fn get_webhook(&mut self, webhook_id: Uuid) -> Result<Option<Webhook>>;

    /// Insert a webhook. A duplicate triple is an [`Error::Conflict`].
    async fn insert_webhook(&mut self, webhook: &Webhook) -> Result<()>;

    /// Record a new provider-side ID for a webhook.
    async fn update_webhook_vcs_id(&mut self, webhook_id: Uuid, vcs_id: &str) -> Result<()>;

    /// Delete a webhook.
    ///
    /// Fails with [`Error::ForeignKeyViolation`] while a link references it;
    /// the transaction stays usable afterwards.
    async fn delete_webhook(&mut self, webhook_id: Uuid) -> Result<()>;

    /// Fetch a workspace link.
    async fn get_workspace_repo(&mut self, workspace_id: &str) -> Result<Option<WorkspaceRepo>>;

    /// Insert a workspace link. An existing link for the workspace is an
    /// [`Error::Conflict`].
    async fn insert_workspace_repo(&mut self, repo: &NewWorkspaceRepo) -> Result<()>;

    /// Delete a workspace link.
    async fn delete_workspace_repo(&mut self, workspace_id: &str) -> Result<()>;

    /// Commit.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Roll back explicitly.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Open the backend named by `database_url` and bring its schema up to
/// date.
///
/// `postgres://` and `postgresql://` URLs select PostgreSQL; `sqlite:` URLs
/// select SQLite.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<Arc<dyn Persistence>> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let persistence = PostgresPersistence::connect(database_url, max_connections).await?;
        Ok(Arc::new(persistence))
    } else if database_url.starts_with("sqlite:") {
        let persistence = SqlitePersistence::connect(database_url, max_connections).await?;
        Ok(Arc::new(persistence))
    } else {
        Err(Error::Validation(format!(
            "unsupported database url scheme: {}",
            database_url.split(':').next().unwrap_or_default()
        )))
    }
}
