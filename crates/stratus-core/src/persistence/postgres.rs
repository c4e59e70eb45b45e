// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.
//!
//! Webhook triples are serialized with transaction-scoped advisory locks.
//! A failed statement aborts a PostgreSQL transaction, so the webhook delete
//! runs inside a savepoint: a foreign-key refusal rolls back to the savepoint
//! and the transaction can still commit the link removal.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
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

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Wrap an existing pool. Migrations must already have been run.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and run migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        migrations::run_postgres(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn with_outputs(&self, record: StateVersionRecord) -> Result<StateVersion> {
        let outputs = sqlx::query_as::<_, StateVersionOutputRecord>(&format!(
            "SELECT {STATE_VERSION_OUTPUT_COLUMNS} FROM state_version_outputs \
             WHERE state_version_id = $1 ORDER BY name"
        ))
        .bind(&record.id)
        .fetch_all(&self.pool)
        .await?;
        record.into_state_version(outputs)
    }
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn insert_runner(&self, runner: &RunnerMeta) -> Result<()> {
        let pool = runner.agent_pool.as_ref();
        sqlx::query(&format!(
            "INSERT INTO runners ({RUNNER_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
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
            "SELECT {RUNNER_COLUMNS} FROM runners WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        record.map(RunnerMeta::try_from).transpose()
    }

    async fn list_runners(&self, opts: &RunnerListOptions) -> Result<Vec<RunnerMeta>> {
        let records = sqlx::query_as::<_, RunnerRecord>(&format!(
            "SELECT {RUNNER_COLUMNS} FROM runners \
             WHERE ($1::text IS NULL OR organization_name = $1) \
               AND ($2::text IS NULL OR agent_pool_id = $2) \
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
            "UPDATE runners SET status = $1, last_status_at = $2, \
             last_ping_at = CASE WHEN $3 THEN $4 ELSE last_ping_at END \
             WHERE id = $5 AND status = $6 AND last_status_at = $7 \
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
        let result = sqlx::query("UPDATE runners SET last_ping_at = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn adjust_runner_jobs(&self, id: &str, delta: i32) -> Result<Option<i32>> {
        let current = sqlx::query_scalar::<_, i32>(
            "UPDATE runners SET current_jobs = current_jobs + $1 WHERE id = $2 \
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
            "{WORKSPACE_REPO_SELECT} WHERE r.workspace_id = $1"
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
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
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
                 VALUES ($1, $2, $3, $4, $5, $6)"
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
            "SELECT {STATE_VERSION_COLUMNS} FROM state_versions WHERE id = $1"
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
             WHERE workspace_id = $1 ORDER BY seq DESC LIMIT 1"
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
            "SELECT COUNT(*) FROM state_versions WHERE ($1::text IS NULL OR workspace_id = $1)",
        )
        .bind(workspace_id)
        .fetch_one(&self.pool)
        .await?;

        let records = sqlx::query_as::<_, StateVersionRecord>(&format!(
            "SELECT {STATE_VERSION_COLUMNS} FROM state_versions \
             WHERE ($1::text IS NULL OR workspace_id = $1) \
             ORDER BY seq DESC LIMIT $2 OFFSET $3"
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

/// Open PostgreSQL transaction.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn lock_webhook_key(&mut self, key: &WebhookKey) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key.lock_key())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn get_webhook_by_key(&mut self, key: &WebhookKey) -> Result<Option<Webhook>> {
        let hook = sqlx::query_as::<_, Webhook>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks \
             WHERE identifier = $1 AND vcs_provider_id = $2 AND cloud = $3"
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
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE webhook_id = $1"
        ))
        .bind(webhook_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(hook)
    }

    async fn insert_webhook(&mut self, webhook: &Webhook) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO webhooks ({WEBHOOK_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
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
        let result = sqlx::query("UPDATE webhooks SET vcs_id = $1 WHERE webhook_id = $2")
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
        sqlx::query("SAVEPOINT delete_webhook")
            .execute(&mut *self.tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM webhooks WHERE webhook_id = $1")
            .bind(webhook_id)
            .execute(&mut *self.tx)
            .await;

        match deleted {
            Ok(_) => {
                sqlx::query("RELEASE SAVEPOINT delete_webhook")
                    .execute(&mut *self.tx)
                    .await?;
                Ok(())
            }
            Err(e) => {
                sqlx::query("ROLLBACK TO SAVEPOINT delete_webhook")
                    .execute(&mut *self.tx)
                    .await?;
                Err(e.into())
            }
        }
    }

    async fn get_workspace_repo(&mut self, workspace_id: &str) -> Result<Option<WorkspaceRepo>> {
        let repo = sqlx::query_as::<_, WorkspaceRepo>(&format!(
            "{WORKSPACE_REPO_SELECT} WHERE r.workspace_id = $1"
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
             VALUES ($1, $2, $3, $4, $5)",
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
        sqlx::query("DELETE FROM workspace_repos WHERE workspace_id = $1")
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::current_timestamp;
    use crate::runner::RegisterOptions;
    use std::net::{IpAddr, Ipv4Addr};

    async fn test_persistence() -> Option<PostgresPersistence> {
        let url = std::env::var("TEST_STRATUS_DATABASE_URL").ok()?;
        PostgresPersistence::connect(&url, 2).await.ok()
    }

    fn webhook() -> Webhook {
        Webhook {
            webhook_id: Uuid::new_v4(),
            vcs_id: "remote-1".into(),
            identifier: format!("acme/{}", Uuid::new_v4().simple()),
            vcs_provider_id: "vcs-1".into(),
            cloud: "github".into(),
            secret: "secret".into(),
            created_at: current_timestamp(),
        }
    }

    #[tokio::test]
    async fn test_runner_status_compare_and_set() {
        let Some(db) = test_persistence().await else {
            eprintln!("Skipping test: TEST_STRATUS_DATABASE_URL not set");
            return;
        };

        let runner = RunnerMeta::register(
            &RegisterOptions {
                version: "1.0.0".into(),
                concurrency: 1,
                ..Default::default()
            },
            None,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        )
        .unwrap();
        db.insert_runner(&runner).await.unwrap();
        assert_eq!(db.get_runner(&runner.id).await.unwrap().unwrap(), runner);

        let mut busy = runner.clone();
        busy.set_status(RunnerStatus::Busy, true).unwrap();
        let stored = db
            .compare_and_set_runner_status(&busy, true, runner.status, runner.last_status_at)
            .await
            .unwrap()
            .expect("expectation matches");
        assert_eq!(stored, busy);
        assert!(
            db.compare_and_set_runner_status(&busy, true, runner.status, runner.last_status_at)
                .await
                .unwrap()
                .is_none()
        );

        // A ping recorded after the read survives a status-only update.
        let pinged_at = stored.last_ping_at + chrono::Duration::seconds(60);
        assert!(db.update_runner_ping(&runner.id, pinged_at).await.unwrap());
        let mut idle = stored.clone();
        idle.set_status(RunnerStatus::Idle, false).unwrap();
        let stored = db
            .compare_and_set_runner_status(&idle, false, stored.status, stored.last_status_at)
            .await
            .unwrap()
            .expect("status and status time are unchanged");
        assert_eq!(stored.status, RunnerStatus::Idle);
        assert_eq!(stored.last_ping_at, pinged_at);
    }

    #[tokio::test]
    async fn test_refused_webhook_delete_keeps_transaction_usable() {
        let Some(db) = test_persistence().await else {
            eprintln!("Skipping test: TEST_STRATUS_DATABASE_URL not set");
            return;
        };

        let hook = webhook();
        let workspace_id = format!("ws-{}", Uuid::new_v4().simple());

        let mut tx = db.begin().await.unwrap();
        tx.lock_webhook_key(&hook.key()).await.unwrap();
        tx.insert_webhook(&hook).await.unwrap();
        tx.insert_workspace_repo(&NewWorkspaceRepo {
            workspace_id: workspace_id.clone(),
            branch: "main".into(),
            vcs_provider_id: hook.vcs_provider_id.clone(),
            webhook_id: hook.webhook_id,
            created_at: current_timestamp(),
        })
        .await
        .unwrap();

        let err = tx.delete_webhook(hook.webhook_id).await.unwrap_err();
        assert!(matches!(err, Error::ForeignKeyViolation), "{err:?}");

        tx.delete_workspace_repo(&workspace_id).await.unwrap();
        tx.delete_webhook(hook.webhook_id).await.unwrap();
        tx.commit().await.unwrap();

        assert!(db.get_workspace_repo(&workspace_id).await.unwrap().is_none());
    }
}
