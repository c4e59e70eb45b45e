// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner registration and status reporting through the registry.

mod common;

use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;

use common::{FixedIp, NoRoute, TestContext};
use stratus_core::error::{Error, ErrorKind};
use stratus_core::persistence::Persistence;
use stratus_core::runner::{
    AccessRequest, Action, RegisterOptions, RunnerAgentPool, RunnerListOptions, RunnerRegistry,
    RunnerStatus,
};

fn register_opts() -> RegisterOptions {
    RegisterOptions {
        name: Some("builder-1".into()),
        version: "0.9.2".into(),
        concurrency: 4,
        ..Default::default()
    }
}

fn pool(organization: &str) -> RunnerAgentPool {
    RunnerAgentPool {
        id: format!("apool-{organization}"),
        name: "default".into(),
        organization_name: organization.into(),
        token_id: "at-1".into(),
    }
}

#[tokio::test]
async fn test_register_persists_idle_runner() {
    let ctx = TestContext::new().await;

    let runner = ctx.registry.register(register_opts(), None).await.unwrap();
    assert_eq!(runner.status, RunnerStatus::Idle);
    assert_eq!(runner.last_ping_at, runner.last_status_at);
    assert_eq!(runner.max_jobs, 4);

    let stored = ctx.registry.get(&runner.id).await.unwrap();
    assert_eq!(stored, runner);
}

#[tokio::test]
async fn test_register_ip_resolution() {
    let ctx = TestContext::new().await;
    let persistence: Arc<dyn Persistence> = Arc::new(ctx.db.clone());

    // Supplied address wins.
    let mut opts = register_opts();
    opts.ip_address = Some("192.0.2.1".parse().unwrap());
    let runner = ctx.registry.register(opts, None).await.unwrap();
    assert_eq!(runner.ip_address.to_string(), "192.0.2.1");

    // Resolved address when none supplied.
    let resolved: IpAddr = "198.51.100.20".parse().unwrap();
    let registry = RunnerRegistry::with_outbound_ip(persistence.clone(), Arc::new(FixedIp(resolved)));
    let runner = registry.register(register_opts(), None).await.unwrap();
    assert_eq!(runner.ip_address, resolved);

    // Loopback when resolution fails.
    let registry = RunnerRegistry::with_outbound_ip(persistence, Arc::new(NoRoute));
    let runner = registry.register(register_opts(), None).await.unwrap();
    assert_eq!(runner.ip_address, IpAddr::V6(Ipv6Addr::LOCALHOST));
}

#[tokio::test]
async fn test_register_with_leftover_jobs_still_registers() {
    let ctx = TestContext::new().await;
    let mut opts = register_opts();
    opts.current_jobs = vec!["job-abc".into()];

    let runner = ctx.registry.register(opts, Some(pool("acme"))).await.unwrap();
    assert_eq!(runner.current_jobs, 0);
    assert_eq!(runner.agent_pool.unwrap().organization_name, "acme");
}

#[tokio::test]
async fn test_terminal_status_rejects_updates_and_keeps_record() {
    let ctx = TestContext::new().await;
    let runner = ctx.registry.register(register_opts(), None).await.unwrap();

    let exited = ctx
        .registry
        .set_status(&runner.id, RunnerStatus::Exited, false)
        .await
        .unwrap();

    for status in RunnerStatus::ALL {
        let err = ctx
            .registry
            .set_status(&runner.id, status, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict, "exited -> {status}");
    }

    let stored = ctx.registry.get(&runner.id).await.unwrap();
    assert_eq!(stored, exited);
}

#[tokio::test]
async fn test_set_status_ping_flag() {
    let ctx = TestContext::new().await;
    let runner = ctx.registry.register(register_opts(), None).await.unwrap();

    let busy = ctx
        .registry
        .set_status(&runner.id, RunnerStatus::Busy, false)
        .await
        .unwrap();
    assert_eq!(busy.status, RunnerStatus::Busy);
    assert!(busy.last_status_at >= runner.last_status_at);
    assert_eq!(busy.last_ping_at, runner.last_ping_at);

    let idle = ctx
        .registry
        .set_status(&runner.id, RunnerStatus::Idle, true)
        .await
        .unwrap();
    assert_eq!(idle.last_ping_at, idle.last_status_at);
    assert_eq!(ctx.registry.get(&runner.id).await.unwrap(), idle);
}

#[tokio::test]
async fn test_concurrent_transitions_respect_terminal_state() {
    let ctx = TestContext::new().await;
    let runner = ctx.registry.register(register_opts(), None).await.unwrap();

    let mut handles = Vec::new();
    for status in [
        RunnerStatus::Busy,
        RunnerStatus::Exited,
        RunnerStatus::Idle,
        RunnerStatus::Unknown,
    ] {
        let registry = ctx.registry.clone();
        let id = runner.id.clone();
        handles.push(tokio::spawn(async move {
            (status, registry.set_status(&id, status, true).await)
        }));
    }

    let mut exited_at = None;
    let mut applied = Vec::new();
    for handle in handles {
        let (status, result) = handle.await.unwrap();
        match result {
            Ok(meta) => {
                if status == RunnerStatus::Exited {
                    exited_at = Some(meta.last_status_at);
                }
                applied.push(meta);
            }
            Err(e) => assert_eq!(e.kind(), ErrorKind::Conflict),
        }
    }

    // Each competitor writes at most once, so the exit cannot run out of
    // retries, and nothing may be applied after it.
    let exited_at = exited_at.expect("exit transition applied");
    for meta in &applied {
        assert!(meta.last_status_at <= exited_at, "{} applied after exit", meta.status);
    }
    let stored = ctx.registry.get(&runner.id).await.unwrap();
    assert_eq!(stored.status, RunnerStatus::Exited);
    assert_eq!(stored.last_status_at, exited_at);
}

#[tokio::test]
async fn test_ping_updates_only_ping_time_even_when_terminal() {
    let ctx = TestContext::new().await;
    let runner = ctx.registry.register(register_opts(), None).await.unwrap();
    let errored = ctx
        .registry
        .set_status(&runner.id, RunnerStatus::Errored, false)
        .await
        .unwrap();

    let pinged = ctx.registry.ping(&runner.id).await.unwrap();
    assert_eq!(pinged.status, RunnerStatus::Errored);
    assert_eq!(pinged.last_status_at, errored.last_status_at);
    assert!(pinged.last_ping_at >= errored.last_ping_at);

    let err = ctx.registry.ping("runner-missing").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { resource: "runner", .. }));
}

#[tokio::test]
async fn test_adjust_current_jobs_is_not_capped() {
    let ctx = TestContext::new().await;
    let mut opts = register_opts();
    opts.concurrency = 1;
    let runner = ctx.registry.register(opts, None).await.unwrap();

    assert_eq!(ctx.registry.adjust_current_jobs(&runner.id, 1).await.unwrap(), 1);
    assert_eq!(ctx.registry.adjust_current_jobs(&runner.id, 1).await.unwrap(), 2);
    assert_eq!(ctx.registry.adjust_current_jobs(&runner.id, -2).await.unwrap(), 0);

    let err = ctx
        .registry
        .adjust_current_jobs("runner-missing", 1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_list_filters_by_organization_and_pool() {
    let ctx = TestContext::new().await;
    let server = ctx.registry.register(register_opts(), None).await.unwrap();
    let acme = ctx
        .registry
        .register(register_opts(), Some(pool("acme")))
        .await
        .unwrap();
    ctx.registry
        .register(register_opts(), Some(pool("globex")))
        .await
        .unwrap();

    let all = ctx.registry.list(&RunnerListOptions::default()).await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().any(|r| r.id == server.id));

    let by_org = ctx
        .registry
        .list(&RunnerListOptions {
            organization: Some("acme".into()),
            pool_id: None,
        })
        .await
        .unwrap();
    assert_eq!(by_org, vec![acme.clone()]);

    let by_pool = ctx
        .registry
        .list(&RunnerListOptions {
            organization: None,
            pool_id: Some("apool-globex".into()),
        })
        .await
        .unwrap();
    assert_eq!(by_pool.len(), 1);
    assert_eq!(by_pool[0].agent_pool.as_ref().unwrap().organization_name, "globex");
}

#[tokio::test]
async fn test_stored_agent_is_scoped_to_its_organization() {
    let ctx = TestContext::new().await;
    let agent = ctx
        .registry
        .register(register_opts(), Some(pool("acme")))
        .await
        .unwrap();
    let agent = ctx.registry.get(&agent.id).await.unwrap();

    assert!(agent.can_access(Action::GetAgentJobs, Some(&AccessRequest::organization("acme"))));
    assert!(!agent.can_access(Action::GetAgentJobs, Some(&AccessRequest::organization("other"))));
    assert!(!agent.can_access(Action::GetAgentJobs, None));
}
