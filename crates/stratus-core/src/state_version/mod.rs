// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Immutable snapshots of workspace state.
//!
//! A state version is written once, by the execution pipeline, and never
//! updated. The payload is kept base64-encoded (standard alphabet); readers
//! get it either encoded, as stored, or decoded via
//! [`StateVersionService::download`]. The newest version of a workspace is
//! its *current* version; "newest" means highest store-assigned sequence
//! number, not highest serial.

mod factory;
mod service;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pagination::{PageOptions, Pagination};

pub use factory::{DefaultStateVersionFactory, StateVersionFactory};
pub use service::StateVersionService;

/// A state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVersion {
    /// Unique ID, `sv-<uuid>`.
    pub id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Serial number recorded in the state document.
    pub serial: i64,
    /// Lineage recorded in the state document.
    pub lineage: Option<String>,
    /// Base64-encoded payload.
    pub state: String,
    /// Run that produced the snapshot.
    pub run_id: Option<String>,
    /// When the version was created.
    pub created_at: DateTime<Utc>,
    /// Creation order within the store. Zero until persisted.
    #[serde(skip)]
    pub seq: i64,
    /// Root module outputs recorded in the state document.
    pub outputs: Vec<StateVersionOutput>,
}

/// An output value recorded in a state version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVersionOutput {
    /// Unique ID, `wsout-<uuid>`.
    pub id: String,
    /// Output name.
    pub name: String,
    /// Type of the value, as a type expression (`"string"`, `["list","number"]`).
    pub output_type: String,
    /// The value.
    pub value: serde_json::Value,
    /// Whether the value must be redacted when displayed.
    pub sensitive: bool,
}

/// Options for creating a state version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateStateVersionOptions {
    /// Serial of the state document.
    pub serial: i64,
    /// Base64-encoded state document.
    pub state: String,
    /// Lineage. Taken from the state document when not supplied.
    #[serde(default)]
    pub lineage: Option<String>,
    /// Run that produced the state.
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Filter and page for listing state versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVersionListOptions {
    /// Only versions of this workspace.
    #[serde(default)]
    pub workspace_id: Option<String>,
    /// Page to return.
    #[serde(flatten)]
    pub page: PageOptions,
}

/// One page of state versions, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVersionList {
    /// Versions on this page.
    pub items: Vec<StateVersion>,
    /// Position of the page.
    pub pagination: Pagination,
}
