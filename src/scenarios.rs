//! End-to-end scenario suite, runnable both as the `--tests` CLI smoke test
//! and from the crate's own integration tests.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::app::recipe::{Awm, Constraints, Recipe};
use crate::app::{make_uid, Exc, ExcState};
use crate::app::registry::ApplicationRegistry;
use crate::error::{Result, RtrmError};
use crate::peer::{build_ip_addresses, DiscoverReply, PeerDirectory, PeerRole, PeerTransport};
use crate::res::accounter::{ResourceAccounter, COMMITTED_VIEW};
use crate::res::path::ResourcePath;
use crate::res::tree::ResourceTree;
use crate::rpc::server::{handle_request, RpcServerContext};
use crate::rpc::wire::{RpcRequest, RpcReply, RpcStatus};
use crate::scheduler::policy::{Policy, ScheduleContext, ScheduleDecision};
use crate::scheduler::policies::greedy::GreedyPolicy;
use crate::scheduler::SchedulerDriver;
use crate::sync::channel::{ChannelRegistry, MockRtLibChannel, SyncPhase};
use crate::sync::SyncManager;

/// Outcome of one named scenario.
#[derive(Debug)]
pub struct ScenarioResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct ScenarioReport {
    pub results: Vec<ScenarioResult>,
}

impl ScenarioReport {
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }
}

fn p(s: &str) -> ResourcePath {
    ResourcePath::parse(s).expect("scenario path is well formed")
}

fn record(results: &mut Vec<ScenarioResult>, name: &'static str, outcome: std::result::Result<(), String>) {
    match outcome {
        Ok(()) => results.push(ScenarioResult { name, passed: true, detail: "ok".into() }),
        Err(detail) => results.push(ScenarioResult { name, passed: false, detail }),
    }
}

/// Run every scenario, collecting pass/fail rather than panicking, so a
/// single regression doesn't hide the rest of the suite's results.
pub async fn run_all() -> ScenarioReport {
    let mut results = Vec::new();
    record(&mut results, "S1-single-awm-schedule", s1_single_awm_schedule().await);
    record(&mut results, "S2-over-commit", s2_over_commit().await);
    record(&mut results, "S3-view-rollback", s3_view_rollback().await);
    record(&mut results, "S4-sync-timeout", s4_sync_timeout().await);
    record(&mut results, "S5-peer-discovery-range", s5_peer_discovery_range().await);
    record(&mut results, "S6-remote-resource-query", s6_remote_resource_query().await);
    ScenarioReport { results }
}

fn recipe_single_awm(pe0: u64, mem0: u64, value: f64) -> Arc<Recipe> {
    Arc::new(Recipe {
        name: "scenario".into(),
        awms: vec![Awm {
            id: 0,
            value,
            requests: HashMap::from([("sys0.cpu0.pe0".to_string(), pe0), ("sys0.mem0".to_string(), mem0)]),
        }],
        constraints: Constraints::default(),
    })
}

fn base_tree() -> ResourceTree {
    let mut tree = ResourceTree::new();
    tree.register(p("sys0.cpu0.pe0"), 100).unwrap();
    tree.register(p("sys0.mem0"), 1024).unwrap();
    tree
}

async fn s1_single_awm_schedule() -> std::result::Result<(), String> {
    let accounter = Arc::new(ResourceAccounter::new(base_tree()));
    let registry = Arc::new(ApplicationRegistry::new());
    let channels = ChannelRegistry::new();
    let uid = make_uid(1, 0);
    let mut exc = Exc::new(uid, "E1", 5, recipe_single_awm(50, 256, 0.7));
    exc.transition(ExcState::Ready).map_err(|e| e.to_string())?;
    registry.register(exc).await;
    channels.attach(uid, Arc::new(MockRtLibChannel::default())).await;

    let sync = Arc::new(SyncManager::new(channels));
    let driver = SchedulerDriver::new(accounter.clone(), registry.clone(), sync, Arc::new(GreedyPolicy::new()));
    let outcome = driver.run_once().await.map_err(|e| e.to_string())?;
    if !outcome.failed.is_empty() {
        return Err(format!("unexpected failures: {:?}", outcome.failed));
    }

    let e1 = registry.get(uid).await.map_err(|e| e.to_string())?;
    if e1.state != ExcState::Running || e1.current_awm != Some(0) {
        return Err(format!("expected Running/awm 0, got {:?}/{:?}", e1.state, e1.current_awm));
    }
    let used_pe0 = accounter.used(&p("sys0.cpu0.pe0"), COMMITTED_VIEW).await.map_err(|e| e.to_string())?;
    let used_mem0 = accounter.used(&p("sys0.mem0"), COMMITTED_VIEW).await.map_err(|e| e.to_string())?;
    if used_pe0 != 50 || used_mem0 != 256 {
        return Err(format!("expected used(pe0)=50 used(mem0)=256, got {used_pe0}/{used_mem0}"));
    }
    Ok(())
}

async fn s2_over_commit() -> std::result::Result<(), String> {
    let accounter = Arc::new(ResourceAccounter::new(base_tree()));
    let registry = Arc::new(ApplicationRegistry::new());
    let channels = ChannelRegistry::new();

    let uid_a = make_uid(2, 0);
    let mut a = Exc::new(uid_a, "A", 9, recipe_single_awm(70, 0, 0.5));
    a.transition(ExcState::Ready).map_err(|e| e.to_string())?;
    registry.register(a).await;
    channels.attach(uid_a, Arc::new(MockRtLibChannel::default())).await;

    let uid_b = make_uid(2, 1);
    let mut b = Exc::new(uid_b, "B", 1, recipe_single_awm(70, 0, 0.5));
    b.transition(ExcState::Ready).map_err(|e| e.to_string())?;
    registry.register(b).await;
    channels.attach(uid_b, Arc::new(MockRtLibChannel::default())).await;

    let sync = Arc::new(SyncManager::new(channels));
    let driver = SchedulerDriver::new(accounter.clone(), registry.clone(), sync, Arc::new(GreedyPolicy::new()));
    driver.run_once().await.map_err(|e| e.to_string())?;

    let ea = registry.get(uid_a).await.map_err(|e| e.to_string())?;
    let eb = registry.get(uid_b).await.map_err(|e| e.to_string())?;
    let running = [&ea, &eb].into_iter().filter(|e| e.state == ExcState::Running).count();
    let ready = [&ea, &eb].into_iter().filter(|e| e.state == ExcState::Ready).count();
    if running != 1 || ready != 1 {
        return Err(format!("expected exactly one Running and one Ready, got {running}/{ready}"));
    }
    let used_pe0 = accounter.used(&p("sys0.cpu0.pe0"), COMMITTED_VIEW).await.map_err(|e| e.to_string())?;
    if used_pe0 != 70 {
        return Err(format!("expected used(pe0)=70, got {used_pe0}"));
    }
    Ok(())
}

/// A policy that stages a partial acquisition on the working view and then
/// deliberately fails, exercising the driver's `DeleteView` rollback path.
struct FailingPolicy;

#[async_trait]
impl Policy for FailingPolicy {
    async fn schedule(&self, ctx: &ScheduleContext<'_>) -> Result<ScheduleDecision> {
        ctx.accounter.acquire(9999, &p("sys0.cpu0.pe0"), 40, ctx.view, true).await?;
        Err(RtrmError::ConfigInvalid("policy deliberately failed after staging an acquisition".into()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

async fn s3_view_rollback() -> std::result::Result<(), String> {
    let accounter = Arc::new(ResourceAccounter::new(base_tree()));
    let before = accounter.used(&p("sys0.cpu0.pe0"), COMMITTED_VIEW).await.map_err(|e| e.to_string())?;

    let registry = Arc::new(ApplicationRegistry::new());
    let channels = ChannelRegistry::new();
    let sync = Arc::new(SyncManager::new(channels));
    let driver = SchedulerDriver::new(accounter.clone(), registry, sync, Arc::new(FailingPolicy));

    let outcome = driver.run_once().await;
    if outcome.is_ok() {
        return Err("expected the failing policy to abort the round".into());
    }

    let after = accounter.used(&p("sys0.cpu0.pe0"), COMMITTED_VIEW).await.map_err(|e| e.to_string())?;
    if before != after {
        return Err(format!("committed view changed: {before} -> {after}"));
    }
    Ok(())
}

async fn s4_sync_timeout() -> std::result::Result<(), String> {
    let accounter = Arc::new(ResourceAccounter::new(base_tree()));
    let registry = Arc::new(ApplicationRegistry::new());
    let channels = ChannelRegistry::new();

    let uid = make_uid(4, 0);
    let mut exc = Exc::new(uid, "E1", 5, recipe_single_awm(50, 256, 0.7));
    exc.transition(ExcState::Ready).map_err(|e| e.to_string())?;
    registry.register(exc).await;
    channels
        .attach(uid, Arc::new(MockRtLibChannel { latency_ms: 5, fail_at: None, hang_at: Some(SyncPhase::PreChange) }))
        .await;

    let sync = Arc::new(SyncManager::new(channels));
    let driver = SchedulerDriver::new(accounter.clone(), registry.clone(), sync, Arc::new(GreedyPolicy::new()));
    let outcome = driver.run_once().await.map_err(|e| e.to_string())?;

    let failed_with_timeout =
        outcome.failed.iter().any(|(u, e)| *u == uid && matches!(e, RtrmError::SyncTimeout { .. }));
    if !failed_with_timeout {
        return Err(format!("expected a SyncTimeout failure for {uid}, got {:?}", outcome.failed));
    }
    let e1 = registry.get(uid).await.map_err(|e| e.to_string())?;
    if e1.state != ExcState::Ready || e1.current_awm.is_some() {
        return Err(format!("expected rollback to Ready/no awm, got {:?}/{:?}", e1.state, e1.current_awm));
    }
    Ok(())
}

struct StaticTransport {
    reachable: Vec<Ipv4Addr>,
}

#[async_trait]
impl PeerTransport for StaticTransport {
    async fn discover(&self, addr: Ipv4Addr, _caller_role: PeerRole) -> Result<DiscoverReply> {
        if self.reachable.contains(&addr) {
            Ok(DiscoverReply { role: PeerRole::Slave, assigned_id: 0 })
        } else {
            Err(RtrmError::PeerUnreachable { id: 0, reason: addr.to_string() })
        }
    }

    async fn ping(&self, _addr: Ipv4Addr, _sender_id: u16) -> Result<Option<u64>> {
        Ok(Some(1))
    }
}

async fn s5_peer_discovery_range() -> std::result::Result<(), String> {
    let start = Ipv4Addr::new(10, 0, 0, 5);
    let end = Ipv4Addr::new(10, 0, 0, 8);
    let local = Ipv4Addr::new(10, 0, 0, 6);

    let addresses = build_ip_addresses(start, end).map_err(|e| e.to_string())?;
    let expected = vec![
        Ipv4Addr::new(10, 0, 0, 5),
        Ipv4Addr::new(10, 0, 0, 6),
        Ipv4Addr::new(10, 0, 0, 7),
        Ipv4Addr::new(10, 0, 0, 8),
    ];
    if addresses != expected {
        return Err(format!("expected {expected:?}, got {addresses:?}"));
    }

    let transport = Arc::new(StaticTransport {
        reachable: vec![Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 7), Ipv4Addr::new(10, 0, 0, 8)],
    });
    let directory = PeerDirectory::new(transport, local, (start, end), false, false);
    directory.tick().await.map_err(|e| e.to_string())?;

    let mut peers = directory.peers().await;
    peers.sort_by_key(|p| p.id);
    if peers.iter().any(|p| p.addr == local) {
        return Err("discovery must skip the local address".into());
    }
    let ids: Vec<u16> = peers.iter().map(|p| p.id).collect();
    if ids != vec![1, 2, 3] {
        return Err(format!("expected dense ids [1, 2, 3], got {ids:?}"));
    }
    Ok(())
}

async fn s6_remote_resource_query() -> std::result::Result<(), String> {
    let mut tree = ResourceTree::new();
    tree.register(p("sys0.mem0"), 1024).unwrap();
    let accounter = Arc::new(ResourceAccounter::new(tree));
    accounter.acquire(1, &p("sys0.mem0"), 300, COMMITTED_VIEW, true).await.map_err(|e| e.to_string())?;

    let registry = Arc::new(ApplicationRegistry::new());
    let transport = Arc::new(StaticTransport { reachable: vec![] });
    let directory = Arc::new(PeerDirectory::new(transport, Ipv4Addr::new(127, 0, 0, 1), (Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(127, 0, 0, 1)), false, false));
    let ctx = RpcServerContext { accounter: accounter.clone(), registry, directory, local_role: PeerRole::Slave };

    let reply = handle_request(
        &ctx,
        RpcRequest::GetResourceStatus { sender_id: 3, path: "sys3.mem0".to_string() },
        std::time::Instant::now(),
    )
    .await;

    match reply {
        RpcReply::ResourceStatus { status: RpcStatus::Ok, total, used, .. } => {
            if total != 1024 || used != 300 {
                return Err(format!("expected total=1024 used=300, got {total}/{used}"));
            }
            Ok(())
        }
        other => Err(format!("unexpected reply: {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_scenario_passes() {
        let report = run_all().await;
        for r in &report.results {
            assert!(r.passed, "{}: {}", r.name, r.detail);
        }
    }
}
