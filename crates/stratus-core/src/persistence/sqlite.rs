// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Transactions open with `BEGIN IMMEDIATE` and so hold the database write
//! lock from their first read, which leaves
//! [`StoreTransaction::lock_webhook_key`] nothing to do here. A failed statement only rolls back itself, which
//! lets a transaction carry on after a refused webhook delete.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::migrations;
use crate::runner::{RunnerListOptions, RunnerMeta, RunnerStatus};
use crate::state_version::StateVersion;
use crate::workspace::{NewWorkspaceRepo, Webhook, WebhookKey, WorkspaceRepo};

use super::{
    Persistence, RUNNER_COLUMNS, RunnerRecord, STATE_VERSION_COLUMNS,
    STATE_VERSION_OUTPUT_COLUMNS, StateVersionOutputRecord, StateVersionRecord,
    StoreTransaction, WEBHOOK_COLUMNS, WORKSPACE_REPO_SELECT, conflict_on_unique,
    encode_output_value,
};

/// How long a connection waits for the write lock. Connect holds it across
/// the remote webhook call.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Wrap an existing pool. Migrations must already have been run and
    /// foreign keys enabled on every connection.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` (`sqlite:<path>` or `sqlite::memory:`),
    /// creating the file if needed, and run migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    /// Open the database file at `path`, creating it and any parent
    /// directories, and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::Database(sqlx::Error::Io(e)))?;
        }
        Self::connect(&format!("sqlite:{}", path.to_string_lossy()), 5).await
    }

    /// A private in-memory database.
    ///
    /// Uses a single connection that is never recycled, since every new
    /// connection to `:memory:` would see an empty database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn with_outputs(&self, record: StateVersionRecord) -> Result<StateVersion> {
        let outputs = sqlx::query_as::<_, StateVersionOutputRecord>(&format!(
            "SELECT {STATE_VERSION_OUTPUT_COLUMNS} FROM state_version_outputs \
             WHERE state_version_id = ?1 ORDER BY name"
        ))
        .bind(&record.id)
        .fetch_all(&self.pool)
        .await?;
        record.into_state_version(outputs)
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        // Take the write lock up front so two transactions cannot both read
        // a key as absent and then race to create it.
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    async fn insert_runner(&self, runner: &RunnerMeta) -> Result<()> {
        let pool = runner.agent_pool.as_ref();
        sqlx::query(&format!(
            "INSERT INTO runners ({RUNNER_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ))
        .bind(&runner.id)
        .bind(&runner.name)
        .bind(&runner.version)
        .bind(runner.status.as_str())
        .bind(runner.max_jobs)
        .bind(runner.current_jobs)
        .bind(runner.last_ping_at)
        .bind(runner.last_status_at)
        .bind(runner.ip_address.to_string())
        .bind(pool.map(|p| p.id.as_str()))
        .bind(pool.map(|p| p.name.as_str()))
        .bind(pool.map(|p| p.organization_name.as_str()))
        .bind(pool.map(|p| p.token_id.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_runner(&self, id: &str) -> Result<Option<RunnerMeta>> {
        let record = sqlx::query_as::<_, RunnerRecord>(&format!(
            "SELECT {RUNNER_COLUMNS} FROM runners WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        record.map(RunnerMeta::try_from).transpose()
    }

    async fn list_runners(&self, opts: &RunnerListOptions) -> Result<Vec<RunnerMeta>> {
        let records = sqlx::query_as::<_, RunnerRecord>(&format!(
            "SELECT {RUNNER_COLUMNS} FROM runners \
             WHERE (?1 IS NULL OR organization_name = ?1) \
               AND (?2 IS NULL OR agent_pool_id = ?2) \
             ORDER BY id"
        ))
        .bind(&opts.organization)
        .bind(&opts.pool_id)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(RunnerMeta::try_from).collect()
    }

    async fn compare_and_set_runner_status(
        &self,
        runner: &RunnerMeta,
        update_ping: bool,
        expected_status: RunnerStatus,
        expected_status_at: DateTime<Utc>,
    ) -> Result<Option<RunnerMeta>> {
        let record = sqlx::query_as::<_, RunnerRecord>(&format!(
            "UPDATE runners SET status = ?1, last_status_at = ?2, \
             last_ping_at = CASE WHEN ?3 THEN ?4 ELSE last_ping_at END \
             WHERE id = ?5 AND status = ?6 AND last_status_at = ?7 \
             RETURNING {RUNNER_COLUMNS}"
        ))
        .bind(runner.status.as_str())
        .bind(runner.last_status_at)
        .bind(update_ping)
        .bind(runner.last_ping_at)
        .bind(&runner.id)
        .bind(expected_status.as_str())
        .bind(expected_status_at)
        .fetch_optional(&self.pool)
        .await?;
        record.map(RunnerMeta::try_from).transpose()
    }

    async fn update_runner_ping(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE runners SET last_ping_at = ?1 WHERE id = ?2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn adjust_runner_jobs(&self, id: &str, delta: i32) -> Result<Option<i32>> {
        let current = sqlx::query_scalar::<_, i32>(
            "UPDATE runners SET current_jobs = current_jobs + ?1 WHERE id = ?2 \
             RETURNING current_jobs",
        )
        .bind(delta)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(current)
    }

    async fn get_workspace_repo(&self, workspace_id: &str) -> Result<Option<WorkspaceRepo>> {
        let repo = sqlx::query_as::<_, WorkspaceRepo>(&format!(
            "{WORKSPACE_REPO_SELECT} WHERE r.workspace_id = ?1"
        ))
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(repo)
    }

    async fn create_state_version(&self, sv: &StateVersion) -> Result<StateVersion> {
        let mut tx = self.pool.begin().await?;

        let seq = sqlx::query_scalar::<_, i64>(
            "INSERT INTO state_versions \
                 (id, workspace_id, serial, lineage, state, run_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             RETURNING seq",
        )
        .bind(&sv.id)
        .bind(&sv.workspace_id)
        .bind(sv.serial)
        .bind(&sv.lineage)
        .bind(&sv.state)
        .bind(&sv.run_id)
        .bind(sv.created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, || format!("state version {} already exists", sv.id)))?;

        for output in &sv.outputs {
            sqlx::query(&format!(
                "INSERT INTO state_version_outputs ({STATE_VERSION_OUTPUT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ))
            .bind(&output.id)
            .bind(&sv.id)
            .bind(&output.name)
            .bind(&output.output_type)
            .bind(encode_output_value(output)?)
            .bind(output.sensitive)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let mut created = sv.clone();
        created.seq = seq;
        Ok(created)
    }

    async fn get_state_version(&self, id: &str) -> Result<Option<StateVersion>> {
        let record = sqlx::query_as::<_, StateVersionRecord>(&format!(
            "SELECT {STATE_VERSION_COLUMNS} FROM state_versions WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match record {
            Some(record) => Ok(Some(self.with_outputs(record).await?)),
            None => Ok(None),
        }
    }

    async fn current_state_version(&self, workspace_id: &str) -> Result<Option<StateVersion>> {
        let record = sqlx::query_as::<_, StateVersionRecord>(&format!(
            "SELECT {STATE_VERSION_COLUMNS} FROM state_versions \
             WHERE workspace_id = ?1 ORDER BY seq DESC LIMIT 1"
        ))
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;
        match record {
            Some(record) => Ok(Some(self.with_outputs(record).await?)),
            None => Ok(None),
        }
    }

    async fn list_state_versions(
        &self,
        workspace_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<StateVersion>, i64)> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM state_versions WHERE (?1 IS NULL OR workspace_id = ?1)",
        )
        .bind(workspace_id)
        .fetch_one(&self.pool)
        .await?;

        let records = sqlx::query_as::<_, StateVersionRecord>(&format!(
            "SELECT {STATE_VERSION_COLUMNS} FROM state_versions \
             WHERE (?1 IS NULL OR workspace_id = ?1) \
             ORDER BY seq DESC LIMIT ?2 OFFSET ?3"
        ))
        .bind(workspace_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(records.len());
        for record in records {
            items.push(self.with_outputs(record).await?);
        }
        Ok((items, total))
    }
}

/// Open SQLite transaction.
pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn lock_webhook_key(&mut self, _key: &WebhookKey) -> Result<()> {
        // Already holding the write lock since BEGIN IMMEDIATE.
        Ok(())
    }

    async fn get_webhook_by_key(&mut self, key: &WebhookKey) -> Result<Option<Webhook>> {
        let hook = sqlx::query_as::<_, Webhook>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks \
             WHERE identifier = ?1 AND vcs_provider_id = ?2 AND cloud = ?3"
        ))
        .bind(&key.identifier)
        .bind(&key.vcs_provider_id)
        .bind(&key.cloud)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(hook)
    }

    async fn get_webhook(&mut self, webhook_id: Uuid) -> Result<Option<Webhook>> {
        let hook = sqlx::query_as::<_, Webhook>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE webhook_id = ?1"
        ))
        .bind(webhook_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(hook)
    }

    async fn insert_webhook(&mut self, webhook: &Webhook) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO webhooks ({WEBHOOK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
        ))
        .bind(webhook.webhook_id)
        .bind(&webhook.vcs_id)
        .bind(&webhook.identifier)
        .bind(&webhook.vcs_provider_id)
        .bind(&webhook.cloud)
        .bind(&webhook.secret)
        .bind(webhook.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| conflict_on_unique(e, || format!("webhook for {} already exists", webhook.key())))?;
        Ok(())
    }

    async fn update_webhook_vcs_id(&mut self, webhook_id: Uuid, vcs_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE webhooks SET vcs_id = ?1 WHERE webhook_id = ?2")
            .bind(vcs_id)
            .bind(webhook_id)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("webhook", webhook_id.to_string()));
        }
        Ok(())
    }

    async fn delete_webhook(&mut self, webhook_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM webhooks WHERE webhook_id = ?1")
            .bind(webhook_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn get_workspace_repo(&mut self, workspace_id: &str) -> Result<Option<WorkspaceRepo>> {
        let repo = sqlx::query_as::<_, WorkspaceRepo>(&format!(
            "{WORKSPACE_REPO_SELECT} WHERE r.workspace_id = ?1"
        ))
        .bind(workspace_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(repo)
    }

    async fn insert_workspace_repo(&mut self, repo: &NewWorkspaceRepo) -> Result<()> {
        sqlx::query(
            "INSERT INTO workspace_repos \
                 (workspace_id, branch, vcs_provider_id, webhook_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&repo.workspace_id)
        .bind(&repo.branch)
        .bind(&repo.vcs_provider_id)
        .bind(repo.webhook_id)
        .bind(repo.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("workspace {} is already connected", repo.workspace_id)
            })
        })?;
        Ok(())
    }

    async fn delete_workspace_repo(&mut self, workspace_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM workspace_repos WHERE workspace_id = ?1")
            .bind(workspace_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
