// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authorization of runners and other subjects.
//!
//! A [`Subject`] is whoever an authenticated request resolved to. Every kind
//! of subject answers the same question through [`Subject::can_access`].
//! Runners never receive site-wide authority: a request without an
//! organization scope is always denied to them.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::runner::meta::RunnerMeta;

/// Actions a subject may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Register a runner.
    RegisterRunner,
    /// Read a runner.
    GetRunner,
    /// List runners.
    ListRunners,
    /// Report a runner's status.
    UpdateRunnerStatus,
    /// Fetch jobs allocated to an agent.
    GetAgentJobs,
    /// Connect a workspace to a repository.
    ConnectWorkspace,
    /// Disconnect a workspace from its repository.
    DisconnectWorkspace,
    /// Create a state version.
    CreateStateVersion,
    /// Read a state version.
    GetStateVersion,
    /// List state versions.
    ListStateVersions,
    /// Download a state version's payload.
    DownloadState,
}

/// Scope of a request being authorized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    /// Organization the request acts on. `None` for site-level requests.
    pub organization: Option<String>,
    /// Workspace the request acts on, if any.
    pub workspace_id: Option<String>,
}

impl AccessRequest {
    /// A request scoped to `organization`.
    pub fn organization(organization: impl Into<String>) -> Self {
        Self {
            organization: Some(organization.into()),
            workspace_id: None,
        }
    }

    /// Narrow the request to a workspace.
    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }
}

impl RunnerMeta {
    /// Whether this runner may carry out `action` within `request`.
    ///
    /// Agents are confined to the organization of their pool whatever the
    /// action; server runners may act on any organization.
    pub fn can_access(&self, _action: Action, request: Option<&AccessRequest>) -> bool {
        let Some(organization) = request.and_then(|r| r.organization.as_deref()) else {
            return false;
        };
        match &self.agent_pool {
            Some(pool) => pool.organization_name == organization,
            None => true,
        }
    }
}

/// A human user, resolved by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSubject {
    /// Username.
    pub username: String,
    /// Site administrators may act anywhere, including site-level requests.
    pub site_admin: bool,
    /// Organizations the user belongs to.
    pub organizations: Vec<String>,
}

/// The authenticated caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// A registered runner.
    Runner(Box<RunnerMeta>),
    /// A user.
    User(UserSubject),
}

impl Subject {
    /// Identifier of the subject, for logging.
    pub fn id(&self) -> &str {
        match self {
            Self::Runner(runner) => &runner.id,
            Self::User(user) => &user.username,
        }
    }

    /// Whether the subject may carry out `action` within `request`.
    pub fn can_access(&self, action: Action, request: Option<&AccessRequest>) -> bool {
        match self {
            Self::Runner(runner) => runner.can_access(action, request),
            Self::User(user) => {
                if user.site_admin {
                    return true;
                }
                match request.and_then(|r| r.organization.as_deref()) {
                    Some(org) => user.organizations.iter().any(|o| o == org),
                    None => false,
                }
            }
        }
    }

    /// Like [`can_access`](Self::can_access) but returns
    /// [`Error::AccessNotPermitted`] on denial.
    pub fn authorize(&self, action: Action, request: Option<&AccessRequest>) -> Result<()> {
        if self.can_access(action, request) {
            Ok(())
        } else {
            tracing::debug!(subject = %self.id(), ?action, ?request, "access denied");
            Err(Error::AccessNotPermitted)
        }
    }
}

/// The runner behind `subject`; any other kind of subject is denied.
pub fn runner_from_subject(subject: &Subject) -> Result<&RunnerMeta> {
    match subject {
        Subject::Runner(runner) => Ok(runner.as_ref()),
        _ => Err(Error::AccessNotPermitted),
    }
}

/// Require `subject` to be the runner identified by `runner_id`.
pub fn authorize_runner<'a>(subject: &'a Subject, runner_id: &str) -> Result<&'a RunnerMeta> {
    let runner = runner_from_subject(subject)?;
    if runner.id != runner_id {
        return Err(Error::AccessNotPermitted);
    }
    Ok(runner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::meta::{RegisterOptions, RunnerAgentPool};
    use std::net::{IpAddr, Ipv6Addr};

    fn runner(pool_org: Option<&str>) -> RunnerMeta {
        let pool = pool_org.map(|org| RunnerAgentPool {
            id: "apool-1".into(),
            name: "pool".into(),
            organization_name: org.into(),
            token_id: "at-1".into(),
        });
        RunnerMeta::register(
            &RegisterOptions {
                version: "1.0.0".into(),
                concurrency: 1,
                ..Default::default()
            },
            pool,
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        )
        .unwrap()
    }

    #[test]
    fn test_agent_confined_to_pool_organization() {
        let agent = runner(Some("acme"));
        let acme = AccessRequest::organization("acme");
        let other = AccessRequest::organization("other");

        assert!(agent.can_access(Action::GetAgentJobs, Some(&acme)));
        assert!(agent.can_access(Action::ConnectWorkspace, Some(&acme)));
        assert!(!agent.can_access(Action::GetAgentJobs, Some(&other)));
        assert!(!agent.can_access(Action::GetAgentJobs, None));
        assert!(!agent.can_access(Action::GetAgentJobs, Some(&AccessRequest::default())));
    }

    #[test]
    fn test_runner_access_does_not_depend_on_action() {
        let agent = runner(Some("acme"));
        let server = runner(None);
        let acme = AccessRequest::organization("acme");
        let other = AccessRequest::organization("other");

        for action in [
            Action::RegisterRunner,
            Action::GetRunner,
            Action::ListRunners,
            Action::UpdateRunnerStatus,
            Action::GetAgentJobs,
            Action::ConnectWorkspace,
            Action::DisconnectWorkspace,
            Action::CreateStateVersion,
            Action::GetStateVersion,
            Action::ListStateVersions,
            Action::DownloadState,
        ] {
            assert!(agent.can_access(action, Some(&acme)), "{action:?}");
            assert!(!agent.can_access(action, Some(&other)), "{action:?}");
            assert!(server.can_access(action, Some(&other)), "{action:?}");
            assert!(!server.can_access(action, None), "{action:?}");
        }
    }

    #[test]
    fn test_server_runner_any_organization_but_not_site() {
        let server = runner(None);
        assert!(server.can_access(
            Action::UpdateRunnerStatus,
            Some(&AccessRequest::organization("acme"))
        ));
        assert!(server.can_access(
            Action::UpdateRunnerStatus,
            Some(&AccessRequest::organization("other").with_workspace("ws-1"))
        ));
        assert!(!server.can_access(Action::UpdateRunnerStatus, None));
        assert!(!server.can_access(Action::UpdateRunnerStatus, Some(&AccessRequest::default())));
    }

    #[test]
    fn test_user_subjects() {
        let admin = Subject::User(UserSubject {
            username: "root".into(),
            site_admin: true,
            organizations: vec![],
        });
        let member = Subject::User(UserSubject {
            username: "bob".into(),
            site_admin: false,
            organizations: vec!["acme".into()],
        });

        assert!(admin.can_access(Action::ListRunners, None));
        assert!(member.can_access(Action::ListRunners, Some(&AccessRequest::organization("acme"))));
        assert!(!member.can_access(Action::ListRunners, Some(&AccessRequest::organization("other"))));
        assert!(!member.can_access(Action::ListRunners, None));
        assert!(matches!(
            member.authorize(Action::ListRunners, None),
            Err(Error::AccessNotPermitted)
        ));
    }

    #[test]
    fn test_runner_from_subject_rejects_users() {
        let user = Subject::User(UserSubject {
            username: "bob".into(),
            site_admin: true,
            organizations: vec![],
        });
        assert!(matches!(
            runner_from_subject(&user),
            Err(Error::AccessNotPermitted)
        ));
    }

    #[test]
    fn test_authorize_runner_requires_matching_id() {
        let meta = runner(Some("acme"));
        let id = meta.id.clone();
        let subject = Subject::Runner(Box::new(meta));

        assert_eq!(authorize_runner(&subject, &id).unwrap().id, id);
        assert!(matches!(
            authorize_runner(&subject, "runner-someoneelse"),
            Err(Error::AccessNotPermitted)
        ));
    }
}
