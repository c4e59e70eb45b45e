// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workspace to VCS repository links and the webhooks backing them.
//!
//! Several workspaces connected to the same repository share one webhook.
//! Whether a webhook is still in use is decided by the foreign key from
//! `workspace_repos.webhook_id` to `webhooks.webhook_id`: deleting a webhook
//! that a link still references fails, and [`WorkspaceConnector::disconnect`]
//! treats that failure as "still shared".

mod connector;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use connector::{ConnectorConfig, WorkspaceConnector};

/// The triple a webhook is unique on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WebhookKey {
    /// Repository identifier, `<owner>/<repo>`.
    pub identifier: String,
    /// VCS provider ID.
    pub vcs_provider_id: String,
    /// VCS host kind, e.g. `github`.
    pub cloud: String,
}

impl WebhookKey {
    /// Key used for transaction-scoped locking of this triple.
    pub fn lock_key(&self) -> String {
        format!(
            "webhook:{}:{}:{}",
            self.cloud, self.vcs_provider_id, self.identifier
        )
    }
}

impl fmt::Display for WebhookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.cloud, self.identifier, self.vcs_provider_id)
    }
}

/// Local mirror of a webhook registered on a VCS provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Webhook {
    /// Local webhook ID; also the last path segment of the callback URL.
    pub webhook_id: Uuid,
    /// ID of the webhook on the VCS provider.
    pub vcs_id: String,
    /// Repository identifier, `<owner>/<repo>`.
    pub identifier: String,
    /// VCS provider ID.
    pub vcs_provider_id: String,
    /// VCS host kind.
    pub cloud: String,
    /// Secret the provider signs deliveries with.
    #[serde(skip_serializing)]
    pub secret: String,
    /// When the webhook was first registered.
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    /// The triple this webhook is unique on.
    pub fn key(&self) -> WebhookKey {
        WebhookKey {
            identifier: self.identifier.clone(),
            vcs_provider_id: self.vcs_provider_id.clone(),
            cloud: self.cloud.clone(),
        }
    }
}

impl fmt::Debug for Webhook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Webhook")
            .field("webhook_id", &self.webhook_id)
            .field("vcs_id", &self.vcs_id)
            .field("identifier", &self.identifier)
            .field("vcs_provider_id", &self.vcs_provider_id)
            .field("cloud", &self.cloud)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// A workspace's connection to a repository, joined with its webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkspaceRepo {
    /// Workspace ID.
    pub workspace_id: String,
    /// Branch runs are triggered for.
    pub branch: String,
    /// VCS provider ID.
    pub vcs_provider_id: String,
    /// Webhook the link relies on.
    pub webhook_id: Uuid,
    /// Repository identifier, `<owner>/<repo>`.
    pub identifier: String,
    /// VCS host kind.
    pub cloud: String,
    /// When the workspace was connected.
    pub created_at: DateTime<Utc>,
}

impl WorkspaceRepo {
    /// The webhook triple this link belongs to.
    pub fn webhook_key(&self) -> WebhookKey {
        WebhookKey {
            identifier: self.identifier.clone(),
            vcs_provider_id: self.vcs_provider_id.clone(),
            cloud: self.cloud.clone(),
        }
    }
}

/// Row inserted when connecting a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorkspaceRepo {
    /// Workspace ID.
    pub workspace_id: String,
    /// Branch runs are triggered for.
    pub branch: String,
    /// VCS provider ID.
    pub vcs_provider_id: String,
    /// Webhook the link relies on.
    pub webhook_id: Uuid,
    /// When the workspace was connected.
    pub created_at: DateTime<Utc>,
}

/// What to connect a workspace to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Repository identifier, `<owner>/<repo>`.
    pub identifier: String,
    /// VCS provider ID.
    pub vcs_provider_id: String,
    /// VCS host kind.
    pub cloud: String,
    /// Branch to follow. Defaults to the repository's default branch.
    #[serde(default)]
    pub branch: Option<String>,
}

impl ConnectOptions {
    /// The webhook triple these options resolve to.
    pub fn webhook_key(&self) -> WebhookKey {
        WebhookKey {
            identifier: self.identifier.clone(),
            vcs_provider_id: self.vcs_provider_id.clone(),
            cloud: self.cloud.clone(),
        }
    }
}

/// Outcome of a disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    /// Workspace that was disconnected.
    pub workspace_id: String,
    /// The link that was removed; `None` if the workspace was not connected.
    pub repo: Option<WorkspaceRepo>,
    /// Whether the webhook was removed too, locally and on the provider.
    /// `false` while other workspaces still share it.
    pub webhook_deleted: bool,
}
