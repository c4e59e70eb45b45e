// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contract for the VCS provider API.
//!
//! The connector only needs four calls from a VCS host: repository metadata
//! and create/update/delete of a webhook registration. Concrete provider
//! clients live outside this crate; [`mock::MockGateway`] is an in-memory
//! implementation for tests and local development.

pub mod mock;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use mock::{GatewayOp, MockGateway};

/// Errors from the VCS provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum VcsError {
    /// The repository or webhook does not exist on the provider.
    #[error("resource not found on VCS provider")]
    NotFound,

    /// The provider rejected the request or could not be reached.
    #[error("request failed: {0}")]
    Request(String),

    /// The call did not complete within the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// Repository metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Repository identifier, `<owner>/<repo>`.
    pub identifier: String,
    /// Default branch.
    pub default_branch: String,
}

/// Events a webhook subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VcsEventType {
    /// Commits pushed to a branch, or a tag pushed.
    Push,
    /// Pull request opened, updated or closed.
    PullRequest,
}

/// Events every stratus webhook subscribes to.
pub const DEFAULT_EVENTS: [VcsEventType; 2] = [VcsEventType::Push, VcsEventType::PullRequest];

/// Options for creating a webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateWebhookOptions {
    /// VCS provider (credentials) to use.
    pub provider_id: String,
    /// Repository identifier, `<owner>/<repo>`.
    pub identifier: String,
    /// Secret the provider signs deliveries with.
    pub secret: String,
    /// URL deliveries are posted to.
    pub url: String,
    /// Subscribed events.
    pub events: Vec<VcsEventType>,
}

/// Options for updating an existing webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateWebhookOptions {
    /// VCS provider (credentials) to use.
    pub provider_id: String,
    /// Repository identifier, `<owner>/<repo>`.
    pub identifier: String,
    /// Provider-side webhook ID.
    pub vcs_id: String,
    /// Secret the provider signs deliveries with.
    pub secret: String,
    /// URL deliveries are posted to.
    pub url: String,
    /// Subscribed events.
    pub events: Vec<VcsEventType>,
}

/// Options for deleting a webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteWebhookOptions {
    /// VCS provider (credentials) to use.
    pub provider_id: String,
    /// Repository identifier, `<owner>/<repo>`.
    pub identifier: String,
    /// Provider-side webhook ID.
    pub vcs_id: String,
}

/// Operations the connector needs from a VCS provider.
///
/// Implementations perform network I/O; callers bound every call with a
/// timeout.
#[async_trait]
pub trait VcsGateway: Send + Sync {
    /// Fetch repository metadata.
    async fn get_repository(
        &self,
        provider_id: &str,
        identifier: &str,
    ) -> Result<Repository, VcsError>;

    /// Register a webhook, returning the provider-side webhook ID.
    async fn create_webhook(&self, opts: &CreateWebhookOptions) -> Result<String, VcsError>;

    /// Bring an existing webhook's configuration in line with `opts`.
    ///
    /// Returns [`VcsError::NotFound`] if the webhook no longer exists on the
    /// provider.
    async fn update_webhook(&self, opts: &UpdateWebhookOptions) -> Result<(), VcsError>;

    /// Remove a webhook.
    async fn delete_webhook(&self, opts: &DeleteWebhookOptions) -> Result<(), VcsError>;
}

/// Run a gateway call, giving up with [`VcsError::Timeout`] after `timeout`.
///
/// On timeout the call's future is dropped.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, VcsError>
where
    F: Future<Output = Result<T, VcsError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| VcsError::Timeout(timeout))?
}
