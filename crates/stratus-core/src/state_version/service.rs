// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State version store operations.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::info;

use crate::error::{Error, Result};
use crate::pagination::Pagination;
use crate::persistence::Persistence;

use super::factory::{DefaultStateVersionFactory, StateVersionFactory};
use super::{CreateStateVersionOptions, StateVersion, StateVersionList, StateVersionListOptions};

/// Creates and serves state versions.
#[derive(Clone)]
pub struct StateVersionService {
    persistence: Arc<dyn Persistence>,
    factory: Arc<dyn StateVersionFactory>,
}

impl StateVersionService {
    /// Service using [`DefaultStateVersionFactory`].
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self::with_factory(persistence, Arc::new(DefaultStateVersionFactory))
    }

    /// Service with a custom factory.
    pub fn with_factory(
        persistence: Arc<dyn Persistence>,
        factory: Arc<dyn StateVersionFactory>,
    ) -> Self {
        Self {
            persistence,
            factory,
        }
    }

    /// Build a state version with the factory and persist it. It becomes the
    /// workspace's current version.
    pub async fn create(
        &self,
        workspace_id: &str,
        opts: CreateStateVersionOptions,
    ) -> Result<StateVersion> {
        let sv = self.factory.new_state_version(workspace_id, &opts).await?;
        let sv = self.persistence.create_state_version(&sv).await?;
        info!(
            state_version_id = %sv.id,
            workspace_id,
            serial = sv.serial,
            outputs = sv.outputs.len(),
            "created state version"
        );
        Ok(sv)
    }

    /// Fetch a state version.
    pub async fn get(&self, id: &str) -> Result<StateVersion> {
        self.persistence
            .get_state_version(id)
            .await?
            .ok_or_else(|| Error::not_found("state version", id))
    }

    /// The workspace's most recently created state version.
    pub async fn current(&self, workspace_id: &str) -> Result<StateVersion> {
        self.persistence
            .current_state_version(workspace_id)
            .await?
            .ok_or_else(|| Error::not_found("current state version", workspace_id))
    }

    /// A page of state versions, newest first.
    pub async fn list(&self, opts: &StateVersionListOptions) -> Result<StateVersionList> {
        let (items, total_count) = self
            .persistence
            .list_state_versions(
                opts.workspace_id.as_deref(),
                opts.page.limit(),
                opts.page.offset(),
            )
            .await?;
        Ok(StateVersionList {
            items,
            pagination: Pagination::new(&opts.page, total_count),
        })
    }

    /// The decoded payload of a state version.
    ///
    /// A payload that does not decode means the stored record is damaged and
    /// is reported as [`Error::Corruption`].
    pub async fn download(&self, id: &str) -> Result<Vec<u8>> {
        let sv = self.get(id).await?;
        STANDARD
            .decode(sv.state.as_bytes())
            .map_err(|e| Error::Corruption(format!("state version {id}: {e}")))
    }
}
