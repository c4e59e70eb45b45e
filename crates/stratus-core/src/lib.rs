// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Core - control plane for remote infrastructure automation
//!
//! This crate holds the state the control plane is responsible for and the
//! rules that keep it consistent. HTTP front ends, job scheduling and the
//! concrete VCS provider clients live elsewhere and use this crate as a
//! library.
//!
//! # Architecture
//!
//! ```text
//!   runner process        connect / disconnect         execution pipeline
//!        │                        │                            │
//!        ▼                        ▼                            ▼
//! ┌────────────────┐   ┌─────────────────────┐   ┌──────────────────────┐
//! │ RunnerRegistry │   │ WorkspaceConnector  │──►│  StateVersionService │
//! │  status FSM    │   │  webhook sync       │   │  create / current    │
//! └────────────────┘   └─────────────────────┘   └──────────────────────┘
//!        │                   │          │                    │
//!        │                   │          ▼                    │
//!        │                   │   ┌────────────┐              │
//!        │                   │   │ VcsGateway │              │
//!        │                   │   └────────────┘              │
//!        ▼                   ▼                               ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │         Persistence (PostgreSQL or SQLite, via sqlx)                │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Runners
//!
//! | Status | Meaning | Transitions |
//! |--------|---------|-------------|
//! | `idle` | waiting for work | any |
//! | `busy` | running jobs | any |
//! | `unknown` | stopped pinging | any |
//! | `errored` | failed | none (terminal) |
//! | `exited` | shut down | none (terminal) |
//!
//! Status updates are compare-and-swap on the stored status and status
//! timestamp; see [`runner::RunnerRegistry::set_status`].
//!
//! # Workspace connections
//!
//! Workspaces connected to the same repository through the same provider
//! share one webhook. The webhook row is deleted only when the foreign key
//! from the last link no longer holds it, and only then is the remote
//! webhook removed. See [`workspace::WorkspaceConnector`].
//!
//! # State versions
//!
//! Immutable, base64-encoded snapshots. The current version of a workspace
//! is the most recently created one. See
//! [`state_version::StateVersionService`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use stratus_core::persistence::SqlitePersistence;
//! use stratus_core::runner::{RegisterOptions, RunnerRegistry, RunnerStatus};
//!
//! let persistence = Arc::new(SqlitePersistence::in_memory().await?);
//! let registry = RunnerRegistry::new(persistence);
//! let runner = registry
//!     .register(RegisterOptions { version: "1.0.0".into(), concurrency: 2, ..Default::default() }, None)
//!     .await?;
//! registry.set_status(&runner.id, RunnerStatus::Busy, true).await?;
//! ```

#![deny(missing_docs)]

pub mod clock;
pub mod error;
pub mod ids;
pub mod migrations;
pub mod net;
pub mod pagination;
pub mod persistence;
pub mod runner;
pub mod state_version;
pub mod vcs;
pub mod workspace;

pub use error::{Error, ErrorKind, Result, Step};
pub use persistence::{Persistence, StoreTransaction};
pub use runner::{RunnerMeta, RunnerRegistry, RunnerStatus};
pub use state_version::{StateVersion, StateVersionService};
pub use vcs::{VcsError, VcsGateway};
pub use workspace::{WorkspaceConnector, WorkspaceRepo};
