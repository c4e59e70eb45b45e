// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runners: the workers that execute jobs.
//!
//! [`meta`] holds the record and its status state machine, [`authz`] decides
//! what a runner (or any other subject) may do, and [`registry`] stores and
//! mutates runner records.

pub mod authz;
pub mod meta;
pub mod registry;

pub use authz::{
    AccessRequest, Action, Subject, UserSubject, authorize_runner, runner_from_subject,
};
pub use meta::{
    RegisterOptions, RunnerAgentPool, RunnerMeta, RunnerStatus, check_transition,
};
pub use registry::{MAX_STATUS_RETRIES, RunnerListOptions, RunnerRegistry};
