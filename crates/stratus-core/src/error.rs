// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stratus-core.
//!
//! Every fallible operation in the crate returns [`Error`]. Failures inside the
//! workspace connect/disconnect transactions are wrapped in [`Error::Step`] so
//! callers can tell which step of the protocol failed; [`Error::kind`] sees
//! through that wrapper to the underlying category.

use std::fmt;

use thiserror::Error;

use crate::vcs::VcsError;

/// Result type using the stratus-core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the runner registry, workspace connector and state
/// version store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested change conflicts with the current state of the record,
    /// e.g. a transition out of a terminal runner status or connecting a
    /// workspace that is already connected.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The subject is not permitted to carry out the action.
    #[error("access to this resource is not permitted")]
    AccessNotPermitted,

    /// No record matched the lookup.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Kind of resource that was looked up.
        resource: &'static str,
        /// Identifier used for the lookup.
        id: String,
    },

    /// A delete was refused because another row still references the record.
    #[error("record is still referenced by another record")]
    ForeignKeyViolation,

    /// The VCS provider failed or timed out.
    #[error("VCS provider error: {0}")]
    Upstream(#[from] VcsError),

    /// A stored record could not be decoded. Not retryable.
    #[error("stored data is corrupt: {0}")]
    Corruption(String),

    /// Options supplied by the caller were rejected.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Any other persistence failure.
    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// A step of a transactional operation failed; the transaction was rolled
    /// back.
    #[error("{step}: {source}")]
    Step {
        /// The step that failed.
        step: Step,
        /// The underlying failure.
        source: Box<Error>,
    },
}

/// Steps of the workspace connect and disconnect transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Fetching repository metadata from the VCS provider.
    FetchRepository,
    /// Opening the local transaction.
    BeginTransaction,
    /// Creating or updating the shared webhook.
    SyncWebhook,
    /// Creating the workspace repository link.
    CreateWorkspaceRepo,
    /// Loading the workspace repository link.
    LoadWorkspaceRepo,
    /// Deleting the workspace repository link.
    DeleteWorkspaceRepo,
    /// Deleting the local webhook record.
    DeleteWebhook,
    /// Deleting the webhook on the VCS provider.
    DeleteRemoteWebhook,
    /// Committing the local transaction.
    Commit,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FetchRepository => "retrieving repository info",
            Self::BeginTransaction => "starting transaction",
            Self::SyncWebhook => "syncing webhook",
            Self::CreateWorkspaceRepo => "creating workspace repo",
            Self::LoadWorkspaceRepo => "loading workspace repo",
            Self::DeleteWorkspaceRepo => "deleting workspace repo",
            Self::DeleteWebhook => "deleting webhook",
            Self::DeleteRemoteWebhook => "deleting webhook from VCS provider",
            Self::Commit => "committing transaction",
        };
        f.write_str(s)
    }
}

/// Category of an [`Error`], independent of any [`Error::Step`] wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`Error::Conflict`].
    Conflict,
    /// See [`Error::AccessNotPermitted`].
    AccessNotPermitted,
    /// See [`Error::NotFound`].
    NotFound,
    /// See [`Error::ForeignKeyViolation`].
    ForeignKeyViolation,
    /// See [`Error::Upstream`].
    Upstream,
    /// See [`Error::Corruption`].
    Corruption,
    /// See [`Error::Validation`].
    Validation,
    /// See [`Error::Database`].
    Database,
}

impl Error {
    /// Wrap `source` as the failure of `step`.
    pub fn step(step: Step, source: impl Into<Error>) -> Self {
        Self::Step {
            step,
            source: Box::new(source.into()),
        }
    }

    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// The category of this error, looking through step wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::AccessNotPermitted => ErrorKind::AccessNotPermitted,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ForeignKeyViolation => ErrorKind::ForeignKeyViolation,
            Self::Upstream(_) => ErrorKind::Upstream,
            Self::Corruption(_) => ErrorKind::Corruption,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Database(_) => ErrorKind::Database,
            Self::Step { source, .. } => source.kind(),
        }
    }

    /// The failing step, if this error came out of a transactional operation.
    pub fn failed_step(&self) -> Option<Step> {
        match self {
            Self::Step { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// The underlying VCS error, if any.
    pub fn vcs_error(&self) -> Option<&VcsError> {
        match self {
            Self::Upstream(e) => Some(e),
            Self::Step { source, .. } => source.vcs_error(),
            _ => None,
        }
    }

    /// Whether retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Upstream | ErrorKind::Database => true,
            ErrorKind::Conflict
            | ErrorKind::AccessNotPermitted
            | ErrorKind::NotFound
            | ErrorKind::ForeignKeyViolation
            | ErrorKind::Corruption
            | ErrorKind::Validation => false,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ForeignKeyViolation
            }
            _ => Self::Database(err),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(sqlx::Error::Migrate(Box::new(err)))
    }
}
