// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connecting and disconnecting workspaces.
//!
//! Both operations run in a single local transaction that interleaves
//! database writes with calls to the VCS provider:
//!
//! ```text
//! connect:     get repo ─► BEGIN ─► lock triple ─► create/update hook ─► insert link ─► COMMIT
//! disconnect:  BEGIN ─► load link ─► delete link ─► delete hook row ─┬─► delete remote hook ─► COMMIT
//!                                                                   └─ still referenced ─────► COMMIT
//! ```
//!
//! Any failure rolls the local transaction back. Remote side effects are not
//! compensated: a webhook created on the provider before a failed commit is
//! left there and logged.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::current_timestamp;
use crate::error::{Error, Result, Step};
use crate::persistence::{Persistence, StoreTransaction};
use crate::vcs::{
    CreateWebhookOptions, DEFAULT_EVENTS, DeleteWebhookOptions, Repository, UpdateWebhookOptions,
    VcsError, VcsGateway, with_timeout,
};

use super::{ConnectOptions, Disconnected, NewWorkspaceRepo, Webhook, WebhookKey, WorkspaceRepo};

/// Connector settings.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Public base URL of the control plane; webhook deliveries are posted to
    /// `{webhook_base_url}/webhooks/vcs/{webhook_id}`.
    pub webhook_base_url: String,
    /// Upper bound on each VCS provider call.
    pub gateway_timeout: Duration,
}

impl ConnectorConfig {
    /// Settings with the default 30 second gateway timeout.
    pub fn new(webhook_base_url: impl Into<String>) -> Self {
        Self {
            webhook_base_url: webhook_base_url.into(),
            gateway_timeout: Duration::from_secs(30),
        }
    }
}

/// Keeps workspace repository links and VCS webhooks consistent.
#[derive(Clone)]
pub struct WorkspaceConnector {
    persistence: Arc<dyn Persistence>,
    gateway: Arc<dyn VcsGateway>,
    config: ConnectorConfig,
}

impl WorkspaceConnector {
    /// Create a connector.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        gateway: Arc<dyn VcsGateway>,
        config: ConnectorConfig,
    ) -> Self {
        Self {
            persistence,
            gateway,
            config,
        }
    }

    /// The callback URL for a webhook.
    pub fn callback_url(&self, webhook_id: Uuid) -> String {
        format!(
            "{}/webhooks/vcs/{}",
            self.config.webhook_base_url.trim_end_matches('/'),
            webhook_id
        )
    }

    /// The workspace's current link, if connected.
    pub async fn get(&self, workspace_id: &str) -> Result<Option<WorkspaceRepo>> {
        self.persistence.get_workspace_repo(workspace_id).await
    }

    /// Connect a workspace to a repository.
    ///
    /// Reuses the webhook of any other workspace connected to the same
    /// repository through the same provider, bringing its configuration up to
    /// date; otherwise registers a new one. Fails with [`Error::Conflict`]
    /// (step [`Step::CreateWorkspaceRepo`]) if the workspace is already
    /// connected.
    pub async fn connect(&self, workspace_id: &str, opts: ConnectOptions) -> Result<WorkspaceRepo> {
        let repo = self
            .call(
                self.gateway
                    .get_repository(&opts.vcs_provider_id, &opts.identifier),
            )
            .await
            .map_err(|e| Error::step(Step::FetchRepository, e))?;

        let mut tx = self
            .persistence
            .begin()
            .await
            .map_err(|e| Error::step(Step::BeginTransaction, e))?;

        let mut created_remote = None;
        let result = self
            .connect_in(tx.as_mut(), workspace_id, &opts, &repo, &mut created_remote)
            .await;

        let result = match result {
            Ok(linked) => tx
                .commit()
                .await
                .map(|()| linked)
                .map_err(|e| Error::step(Step::Commit, e)),
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(workspace_id, error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        };

        match &result {
            Ok(linked) => info!(
                workspace_id,
                identifier = %linked.identifier,
                webhook_id = %linked.webhook_id,
                "connected workspace"
            ),
            Err(e) => {
                if let Some(vcs_id) = created_remote {
                    warn!(
                        workspace_id,
                        identifier = %opts.identifier,
                        vcs_id = %vcs_id,
                        error = %e,
                        "connect failed after creating a webhook on the provider; remote webhook orphaned"
                    );
                }
            }
        }
        result
    }

    async fn connect_in(
        &self,
        tx: &mut dyn StoreTransaction,
        workspace_id: &str,
        opts: &ConnectOptions,
        repo: &Repository,
        created_remote: &mut Option<String>,
    ) -> Result<WorkspaceRepo> {
        if tx
            .get_workspace_repo(workspace_id)
            .await
            .map_err(|e| Error::step(Step::LoadWorkspaceRepo, e))?
            .is_some()
        {
            return Err(Error::step(
                Step::CreateWorkspaceRepo,
                Error::Conflict(format!("workspace {workspace_id} is already connected")),
            ));
        }

        let hook = self
            .sync_webhook(tx, &opts.webhook_key(), created_remote)
            .await
            .map_err(|e| Error::step(Step::SyncWebhook, e))?;

        let link = NewWorkspaceRepo {
            workspace_id: workspace_id.to_string(),
            branch: opts
                .branch
                .clone()
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| repo.default_branch.clone()),
            vcs_provider_id: opts.vcs_provider_id.clone(),
            webhook_id: hook.webhook_id,
            created_at: current_timestamp(),
        };
        tx.insert_workspace_repo(&link)
            .await
            .map_err(|e| Error::step(Step::CreateWorkspaceRepo, e))?;

        tx.get_workspace_repo(workspace_id)
            .await
            .and_then(|linked| linked.ok_or_else(|| Error::not_found("workspace repo", workspace_id)))
            .map_err(|e| Error::step(Step::LoadWorkspaceRepo, e))
    }

    /// Find or register the webhook for `key`, leaving the provider-side
    /// configuration matching the local record.
    async fn sync_webhook(
        &self,
        tx: &mut dyn StoreTransaction,
        key: &WebhookKey,
        created_remote: &mut Option<String>,
    ) -> Result<Webhook> {
        tx.lock_webhook_key(key).await?;

        let Some(mut hook) = tx.get_webhook_by_key(key).await? else {
            let webhook_id = Uuid::new_v4();
            let secret = Uuid::new_v4().simple().to_string();
            let vcs_id = self
                .create_remote(key, webhook_id, &secret, created_remote)
                .await?;
            let hook = Webhook {
                webhook_id,
                vcs_id,
                identifier: key.identifier.clone(),
                vcs_provider_id: key.vcs_provider_id.clone(),
                cloud: key.cloud.clone(),
                secret,
                created_at: current_timestamp(),
            };
            tx.insert_webhook(&hook).await?;
            debug!(webhook_id = %hook.webhook_id, vcs_id = %hook.vcs_id, "created webhook");
            return Ok(hook);
        };

        let update = UpdateWebhookOptions {
            provider_id: key.vcs_provider_id.clone(),
            identifier: key.identifier.clone(),
            vcs_id: hook.vcs_id.clone(),
            secret: hook.secret.clone(),
            url: self.callback_url(hook.webhook_id),
            events: DEFAULT_EVENTS.to_vec(),
        };
        match self.call(self.gateway.update_webhook(&update)).await {
            Ok(()) => {
                debug!(webhook_id = %hook.webhook_id, "reusing webhook");
            }
            Err(VcsError::NotFound) => {
                warn!(
                    webhook_id = %hook.webhook_id,
                    vcs_id = %hook.vcs_id,
                    "webhook missing on provider; recreating"
                );
                let vcs_id = self
                    .create_remote(key, hook.webhook_id, &hook.secret, created_remote)
                    .await?;
                tx.update_webhook_vcs_id(hook.webhook_id, &vcs_id).await?;
                hook.vcs_id = vcs_id;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(hook)
    }

    async fn create_remote(
        &self,
        key: &WebhookKey,
        webhook_id: Uuid,
        secret: &str,
        created_remote: &mut Option<String>,
    ) -> Result<String> {
        let create = CreateWebhookOptions {
            provider_id: key.vcs_provider_id.clone(),
            identifier: key.identifier.clone(),
            secret: secret.to_string(),
            url: self.callback_url(webhook_id),
            events: DEFAULT_EVENTS.to_vec(),
        };
        let vcs_id = self.call(self.gateway.create_webhook(&create)).await?;
        *created_remote = Some(vcs_id.clone());
        Ok(vcs_id)
    }

    /// Disconnect a workspace from its repository.
    ///
    /// Removes the webhook too, locally and on the provider, unless another
    /// workspace still uses it. Disconnecting a workspace that is not
    /// connected succeeds without changing anything.
    ///
    /// A webhook the provider no longer knows (`VcsError::NotFound` on
    /// delete) counts as already deleted and the disconnect commits. Any
    /// other provider failure rolls the whole disconnect back.
    pub async fn disconnect(&self, workspace_id: &str) -> Result<Disconnected> {
        let mut tx = self
            .persistence
            .begin()
            .await
            .map_err(|e| Error::step(Step::BeginTransaction, e))?;

        match self.disconnect_in(tx.as_mut(), workspace_id).await {
            Ok(disconnected) => {
                tx.commit()
                    .await
                    .map_err(|e| Error::step(Step::Commit, e))?;
                if let Some(repo) = &disconnected.repo {
                    info!(
                        workspace_id,
                        identifier = %repo.identifier,
                        webhook_id = %repo.webhook_id,
                        webhook_deleted = disconnected.webhook_deleted,
                        "disconnected workspace"
                    );
                }
                Ok(disconnected)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(workspace_id, error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn disconnect_in(
        &self,
        tx: &mut dyn StoreTransaction,
        workspace_id: &str,
    ) -> Result<Disconnected> {
        let Some(repo) = tx
            .get_workspace_repo(workspace_id)
            .await
            .map_err(|e| Error::step(Step::LoadWorkspaceRepo, e))?
        else {
            debug!(workspace_id, "workspace not connected; nothing to disconnect");
            return Ok(Disconnected {
                workspace_id: workspace_id.to_string(),
                repo: None,
                webhook_deleted: false,
            });
        };

        tx.lock_webhook_key(&repo.webhook_key())
            .await
            .map_err(|e| Error::step(Step::DeleteWorkspaceRepo, e))?;
        tx.delete_workspace_repo(workspace_id)
            .await
            .map_err(|e| Error::step(Step::DeleteWorkspaceRepo, e))?;

        let hook = tx
            .get_webhook(repo.webhook_id)
            .await
            .and_then(|hook| {
                hook.ok_or_else(|| Error::not_found("webhook", repo.webhook_id.to_string()))
            })
            .map_err(|e| Error::step(Step::DeleteWebhook, e))?;

        match tx.delete_webhook(hook.webhook_id).await {
            Ok(()) => {}
            Err(Error::ForeignKeyViolation) => {
                debug!(
                    workspace_id,
                    webhook_id = %hook.webhook_id,
                    "webhook still used by other workspaces"
                );
                return Ok(Disconnected {
                    workspace_id: workspace_id.to_string(),
                    repo: Some(repo),
                    webhook_deleted: false,
                });
            }
            Err(e) => return Err(Error::step(Step::DeleteWebhook, e)),
        }

        let delete = DeleteWebhookOptions {
            provider_id: hook.vcs_provider_id.clone(),
            identifier: hook.identifier.clone(),
            vcs_id: hook.vcs_id.clone(),
        };
        match self.call(self.gateway.delete_webhook(&delete)).await {
            Ok(()) => {}
            Err(VcsError::NotFound) => {
                debug!(webhook_id = %hook.webhook_id, "webhook already gone from provider");
            }
            Err(e) => return Err(Error::step(Step::DeleteRemoteWebhook, e)),
        }

        Ok(Disconnected {
            workspace_id: workspace_id.to_string(),
            repo: Some(repo),
            webhook_deleted: true,
        })
    }

    async fn call<T>(
        &self,
        call: impl std::future::Future<Output = std::result::Result<T, VcsError>>,
    ) -> std::result::Result<T, VcsError> {
        with_timeout(self.config.gateway_timeout, call).await
    }
}
