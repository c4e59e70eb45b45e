// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Server - control plane process
//!
//! Hosts the [`stratus_core`] services: loads configuration, connects the
//! persistence layer, and runs the background workers that keep runner
//! state honest.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    ControlPlaneRuntime                       │
//! │  ┌────────────────┐ ┌────────────────────┐ ┌──────────────┐  │
//! │  │ RunnerRegistry │ │ WorkspaceConnector │ │ StateVersion │  │
//! │  │                │ │   (with gateway)   │ │   Service    │  │
//! │  └───────▲────────┘ └────────────────────┘ └──────────────┘  │
//! │          │ demote silent runners                             │
//! │  ┌───────┴────────┐                                          │
//! │  │ RunnerMonitor  │  sweeps every poll interval              │
//! │  └────────────────┘                                          │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//!               PostgreSQL or SQLite (stratus-core)
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `STRATUS_DATABASE_URL` | Yes | - | `postgres://...` or `sqlite:...` |
//! | `STRATUS_WEBHOOK_BASE_URL` | No | - | Public base URL for webhook callbacks; needed once a VCS gateway is embedded |
//! | `STRATUS_DB_MAX_CONNECTIONS` | No | `10` | Pool size |
//! | `STRATUS_VCS_TIMEOUT_SECS` | No | `30` | Bound on each VCS provider call |
//! | `STRATUS_RUNNER_MONITOR_INTERVAL_SECS` | No | `10` | Runner monitor sweep interval |
//! | `STRATUS_RUNNER_PING_TIMEOUT_SECS` | No | `30` | Silence before idle/busy becomes unknown |
//! | `STRATUS_RUNNER_UNKNOWN_TIMEOUT_SECS` | No | `300` | Time in unknown before errored |

#![deny(missing_docs)]

/// Server configuration loaded from environment variables.
pub mod config;

/// Background worker that demotes runners which stopped pinging.
pub mod runner_monitor;

/// Embeddable runtime for the control plane.
pub mod runtime;

pub use config::Config;
pub use runtime::ControlPlaneRuntime;
