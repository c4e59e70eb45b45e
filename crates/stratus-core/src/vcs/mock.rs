// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory VCS gateway for tests and local development.
//!
//! Keeps registered webhooks in a map, counts calls per operation and can be
//! told to fail or stall individual operations.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    CreateWebhookOptions, DeleteWebhookOptions, Repository, UpdateWebhookOptions, VcsError,
    VcsEventType, VcsGateway,
};

/// Gateway operations, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    /// [`VcsGateway::get_repository`].
    GetRepository,
    /// [`VcsGateway::create_webhook`].
    CreateWebhook,
    /// [`VcsGateway::update_webhook`].
    UpdateWebhook,
    /// [`VcsGateway::delete_webhook`].
    DeleteWebhook,
}

/// A webhook as registered with the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockHook {
    /// Repository identifier.
    pub identifier: String,
    /// Delivery URL.
    pub url: String,
    /// Signing secret.
    pub secret: String,
    /// Subscribed events.
    pub events: Vec<VcsEventType>,
}

#[derive(Default)]
struct MockState {
    hooks: HashMap<String, MockHook>,
    next_id: u64,
    calls: HashMap<GatewayOp, usize>,
    faults: HashMap<GatewayOp, VcsError>,
    delays: HashMap<GatewayOp, Duration>,
}

/// Mock gateway.
pub struct MockGateway {
    state: Mutex<MockState>,
    default_branch: String,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    /// Create a mock whose repositories all have default branch `main`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            default_branch: "main".to_string(),
        }
    }

    /// Make every subsequent `op` call fail with `err`.
    pub async fn fail(&self, op: GatewayOp, err: VcsError) {
        self.state.lock().await.faults.insert(op, err);
    }

    /// Stop failing `op`.
    pub async fn clear_fault(&self, op: GatewayOp) {
        self.state.lock().await.faults.remove(&op);
    }

    /// Make every subsequent `op` call wait `delay` before doing anything.
    pub async fn delay(&self, op: GatewayOp, delay: Duration) {
        self.state.lock().await.delays.insert(op, delay);
    }

    /// Number of `op` calls so far, including failed ones.
    pub async fn calls(&self, op: GatewayOp) -> usize {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Currently registered webhooks by provider-side ID.
    pub async fn hooks(&self) -> HashMap<String, MockHook> {
        self.state.lock().await.hooks.clone()
    }

    /// Remove a webhook behind the connector's back, as a repository admin
    /// deleting it on the provider would.
    pub async fn remove_remote_hook(&self, vcs_id: &str) -> Option<MockHook> {
        self.state.lock().await.hooks.remove(vcs_id)
    }

    async fn enter(&self, op: GatewayOp) -> Result<(), VcsError> {
        let delay = {
            let mut state = self.state.lock().await;
            *state.calls.entry(op).or_default() += 1;
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.state.lock().await.faults.get(&op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl VcsGateway for MockGateway {
    async fn get_repository(
        &self,
        _provider_id: &str,
        identifier: &str,
    ) -> Result<Repository, VcsError> {
        self.enter(GatewayOp::GetRepository).await?;
        Ok(Repository {
            identifier: identifier.to_string(),
            default_branch: self.default_branch.clone(),
        })
    }

    async fn create_webhook(&self, opts: &CreateWebhookOptions) -> Result<String, VcsError> {
        self.enter(GatewayOp::CreateWebhook).await?;
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let vcs_id = format!("hook-{}", state.next_id);
        state.hooks.insert(
            vcs_id.clone(),
            MockHook {
                identifier: opts.identifier.clone(),
                url: opts.url.clone(),
                secret: opts.secret.clone(),
                events: opts.events.clone(),
            },
        );
        Ok(vcs_id)
    }

    async fn update_webhook(&self, opts: &UpdateWebhookOptions) -> Result<(), VcsError> {
        self.enter(GatewayOp::UpdateWebhook).await?;
        let mut state = self.state.lock().await;
        let hook = state.hooks.get_mut(&opts.vcs_id).ok_or(VcsError::NotFound)?;
        hook.url = opts.url.clone();
        hook.secret = opts.secret.clone();
        hook.events = opts.events.clone();
        Ok(())
    }

    async fn delete_webhook(&self, opts: &DeleteWebhookOptions) -> Result<(), VcsError> {
        self.enter(GatewayOp::DeleteWebhook).await?;
        self.state
            .lock()
            .await
            .hooks
            .remove(&opts.vcs_id)
            .map(|_| ())
            .ok_or(VcsError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::DEFAULT_EVENTS;

    fn create_opts() -> CreateWebhookOptions {
        CreateWebhookOptions {
            provider_id: "vcs-1".into(),
            identifier: "acme/infra".into(),
            secret: "s".into(),
            url: "https://stratus.test/webhooks/vcs/1".into(),
            events: DEFAULT_EVENTS.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let gw = MockGateway::new();
        let vcs_id = gw.create_webhook(&create_opts()).await.unwrap();
        assert_eq!(gw.hooks().await.len(), 1);

        gw.update_webhook(&UpdateWebhookOptions {
            provider_id: "vcs-1".into(),
            identifier: "acme/infra".into(),
            vcs_id: vcs_id.clone(),
            secret: "s2".into(),
            url: "https://stratus.test/webhooks/vcs/1".into(),
            events: vec![VcsEventType::Push],
        })
        .await
        .unwrap();
        assert_eq!(gw.hooks().await[&vcs_id].secret, "s2");

        let delete = DeleteWebhookOptions {
            provider_id: "vcs-1".into(),
            identifier: "acme/infra".into(),
            vcs_id,
        };
        gw.delete_webhook(&delete).await.unwrap();
        assert_eq!(gw.delete_webhook(&delete).await, Err(VcsError::NotFound));
        assert_eq!(gw.calls(GatewayOp::DeleteWebhook).await, 2);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let gw = MockGateway::new();
        gw.fail(GatewayOp::CreateWebhook, VcsError::Request("503".into()))
            .await;
        assert!(gw.create_webhook(&create_opts()).await.is_err());
        assert!(gw.hooks().await.is_empty());

        gw.clear_fault(GatewayOp::CreateWebhook).await;
        assert!(gw.create_webhook(&create_opts()).await.is_ok());
    }
}
