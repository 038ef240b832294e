//! Synchronization Manager (C5): the "Starvation-Avoidance State-Based"
//! (SASB) protocol.

pub mod channel;

use std::time::Duration;

use tracing::{info, warn};

use crate::app::registry::ApplicationRegistry;
use crate::app::{Awm, ExcState, Recipe, SyncState};
use crate::error::{Result, RtrmError};
use crate::res::accounter::ResourceAccounter;
use channel::{ChannelRegistry, SyncPhase};

/// Minimum per-phase timeout floor.
pub const MIN_PHASE_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceChangeClass {
    Reconf,
    Migrec,
    Migrate,
}

impl ResourceChangeClass {
    /// SASB sub-class iteration order within a priority bucket: MIGRATE,
    /// then MIGREC, then RECONF.
    fn order_key(self) -> u8 {
        match self {
            ResourceChangeClass::Migrate => 0,
            ResourceChangeClass::Migrec => 1,
            ResourceChangeClass::Reconf => 2,
        }
    }

    fn to_sync_state(self) -> SyncState {
        match self {
            ResourceChangeClass::Reconf => SyncState::Reconf,
            ResourceChangeClass::Migrec => SyncState::Migrec,
            ResourceChangeClass::Migrate => SyncState::Migrate,
        }
    }
}

/// Classify a resource-set change between the current and next AWM.
/// Disjoint path sets = a full migration; identical path sets = an
/// in-place reconfiguration; partial overlap = migration + reconfiguration.
pub fn classify_change(current: Option<&Awm>, next: &Awm) -> ResourceChangeClass {
    let Some(current) = current else {
        return ResourceChangeClass::Migrate;
    };
    let cur_paths: std::collections::HashSet<&String> = current.requests.keys().collect();
    let next_paths: std::collections::HashSet<&String> = next.requests.keys().collect();
    if cur_paths == next_paths {
        ResourceChangeClass::Reconf
    } else if cur_paths.is_disjoint(&next_paths) {
        ResourceChangeClass::Migrate
    } else {
        ResourceChangeClass::Migrec
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDirection {
    Decreased,
    Increased,
    Same,
}

/// One EXC's scheduled transition for this round, produced by the Scheduler
/// Driver and consumed by the Sync Manager.
#[derive(Debug, Clone)]
pub struct ScheduledTransition {
    pub uid: u64,
    pub from_awm: Option<u32>,
    pub to_awm: u32,
    pub resource_class: ResourceChangeClass,
    pub value_direction: ValueDirection,
    pub is_starter: bool,
}

/// A token uniquely identifying one handshake instance.
pub type SyncToken = u64;

/// Outcome of running a round of the SASB protocol.
#[derive(Debug, Default)]
pub struct RoundOutcome {
    pub succeeded: Vec<u64>,
    pub failed: Vec<(u64, RtrmError)>,
}

impl RoundOutcome {
    pub fn partially_failed(&self) -> bool {
        !self.failed.is_empty()
    }
}

pub struct SyncManager {
    channels: ChannelRegistry,
}

impl SyncManager {
    pub fn new(channels: ChannelRegistry) -> Self {
        Self { channels }
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Run one SASB round: blocked-out, then low-priority rebind
    /// (MIGRATE, MIGREC, RECONF among decreased-value EXCs), then
    /// high-priority rebind (same sub-order among increased-value EXCs),
    /// then starters.
    pub async fn run_round(
        &self,
        registry: &ApplicationRegistry,
        accounter: &ResourceAccounter,
        view: u64,
        blocked_out: &[u64],
        transitions: &[ScheduledTransition],
        token_seed: &mut u64,
    ) -> RoundOutcome {
        let mut outcome = RoundOutcome::default();

        // 1. Blocked-out.
        for &uid in blocked_out {
            *token_seed += 1;
            match self.evict(registry, accounter, view, uid, *token_seed).await {
                Ok(()) => outcome.succeeded.push(uid),
                Err(e) => outcome.failed.push((uid, e)),
            }
        }

        // 2 & 3. Low- then high-priority rebind, each MIGRATE, MIGREC, RECONF.
        let mut rebinds: Vec<&ScheduledTransition> =
            transitions.iter().filter(|t| !t.is_starter).collect();
        rebinds.sort_by(|a, b| {
            priority_rank(a.value_direction)
                .cmp(&priority_rank(b.value_direction))
                .then(a.resource_class.order_key().cmp(&b.resource_class.order_key()))
        });
        for t in rebinds {
            *token_seed += 1;
            match self.reconfigure(registry, accounter, view, t, *token_seed).await {
                Ok(()) => outcome.succeeded.push(t.uid),
                Err(e) => outcome.failed.push((t.uid, e)),
            }
        }

        // 4. Starters.
        let starters: Vec<&ScheduledTransition> = transitions.iter().filter(|t| t.is_starter).collect();
        for t in starters {
            *token_seed += 1;
            match self.reconfigure(registry, accounter, view, t, *token_seed).await {
                Ok(()) => outcome.succeeded.push(t.uid),
                Err(e) => outcome.failed.push((t.uid, e)),
            }
        }

        outcome
    }

    async fn reconfigure(
        &self,
        registry: &ApplicationRegistry,
        accounter: &ResourceAccounter,
        view: u64,
        t: &ScheduledTransition,
        token: SyncToken,
    ) -> Result<()> {
        let exc = registry.get(t.uid).await?;
        let bound = exc.recipe.bind(t.to_awm)?;
        let old_bound = match t.from_awm {
            Some(id) => exc.recipe.bind(id)?.requests,
            None => Vec::new(),
        };
        let channel = self
            .channels
            .get(t.uid)
            .await
            .ok_or_else(|| RtrmError::NotFound(format!("channel for exc {}", t.uid)))?;

        registry
            .update(t.uid, |e| e.begin_sync(t.to_awm, t.resource_class.to_sync_state()))
            .await?;

        let handshake = async {
            let latency_ms = channel
                .pre_change(token, Some(t.to_awm), &bound.requests)
                .await?;
            let timeout = Duration::from_millis(latency_ms).max(MIN_PHASE_TIMEOUT);

            let sync_ok = run_phase_with_timeout(
                t.uid,
                SyncPhase::SyncChange,
                timeout,
                channel.sync_change(token),
            )
            .await?;
            if !sync_ok {
                return Err(RtrmError::SyncFailed { uid: t.uid, phase: "SyncChange".into() });
            }

            run_phase_with_timeout(t.uid, SyncPhase::DoChange, timeout, channel.do_change(token))
                .await?;

            let post_ok = run_phase_with_timeout(
                t.uid,
                SyncPhase::PostChange,
                timeout,
                channel.post_change(token),
            )
            .await?;
            if !post_ok {
                return Err(RtrmError::SyncFailed { uid: t.uid, phase: "PostChange".into() });
            }
            Ok::<(), RtrmError>(())
        };

        match handshake.await {
            Ok(()) => {
                registry.update(t.uid, |e| e.transition(ExcState::Running)).await?;
                info!(uid = t.uid, awm = t.to_awm, "exc synchronized to new awm");
                Ok(())
            }
            Err(e) => {
                warn!(uid = t.uid, err = %e, "sync handshake failed, rolling back");
                // The scheduler already reserved `bound`'s resources on `view`
                // before proposing this transition; move them back to
                // whatever the EXC held before (empty for a starter).
                accounter.rebind(t.uid, &bound.requests, &old_bound, view).await?;
                registry.update(t.uid, |e| e.rollback_sync()).await?;
                Err(e)
            }
        }
    }

    async fn evict(
        &self,
        registry: &ApplicationRegistry,
        accounter: &ResourceAccounter,
        view: u64,
        uid: u64,
        token: SyncToken,
    ) -> Result<()> {
        let exc = registry.get(uid).await?;
        let held = match exc.current_awm {
            Some(id) => exc.recipe.bind(id)?.requests,
            None => Vec::new(),
        };
        let channel = self
            .channels
            .get(uid)
            .await
            .ok_or_else(|| RtrmError::NotFound(format!("channel for exc {uid}")))?;

        registry.update(uid, |e| e.begin_sync(exc.current_awm.unwrap_or(0), SyncState::Blocked)).await?;

        let handshake = async {
            let latency_ms = channel.pre_change(token, None, &[]).await?;
            let timeout = Duration::from_millis(latency_ms).max(MIN_PHASE_TIMEOUT);
            let sync_ok = run_phase_with_timeout(
                uid,
                SyncPhase::SyncChange,
                timeout,
                channel.sync_change(token),
            )
            .await?;
            if !sync_ok {
                return Err(RtrmError::SyncFailed { uid, phase: "SyncChange".into() });
            }
            run_phase_with_timeout(uid, SyncPhase::DoChange, timeout, channel.do_change(token))
                .await?;
            let post_ok = run_phase_with_timeout(
                uid,
                SyncPhase::PostChange,
                timeout,
                channel.post_change(token),
            )
            .await?;
            if !post_ok {
                return Err(RtrmError::SyncFailed { uid, phase: "PostChange".into() });
            }
            Ok::<(), RtrmError>(())
        };

        match handshake.await {
            Ok(()) => {
                for (path, _) in &held {
                    accounter.release(uid, path, view).await?;
                }
                registry
                    .update(uid, |e| {
                        e.current_awm = None;
                        e.transition(ExcState::Ready)
                    })
                    .await?;
                info!(uid, "exc blocked out and released");
                Ok(())
            }
            Err(e) => {
                registry.update(uid, |e| e.rollback_sync()).await?;
                Err(e)
            }
        }
    }
}

fn priority_rank(dir: ValueDirection) -> u8 {
    match dir {
        ValueDirection::Decreased | ValueDirection::Same => 0,
        ValueDirection::Increased => 1,
    }
}

async fn run_phase_with_timeout<F, T>(
    uid: u64,
    phase: SyncPhase,
    timeout: Duration,
    fut: F,
) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(inner) => inner,
        Err(_) => Err(RtrmError::SyncTimeout { uid, phase: phase.to_string() }),
    }
}

/// Value-direction helper: compares the quality values of the EXC's
/// previous and next AWM within `recipe`.
pub fn value_direction(recipe: &Recipe, from_awm: Option<u32>, to_awm: u32) -> ValueDirection {
    let to_value = recipe.awm(to_awm).map(|a| a.value).unwrap_or(0.0);
    let from_value = from_awm.and_then(|id| recipe.awm(id)).map(|a| a.value);
    match from_value {
        None => ValueDirection::Increased,
        Some(v) if to_value > v => ValueDirection::Increased,
        Some(v) if to_value < v => ValueDirection::Decreased,
        Some(_) => ValueDirection::Same,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::recipe::Constraints;
    use crate::app::{make_uid, Exc};
    use crate::res::path::ResourcePath;
    use crate::res::tree::ResourceTree;
    use super::channel::MockRtLibChannel;
    use std::collections::HashMap as Map;
    use std::sync::Arc;

    fn recipe() -> Arc<Recipe> {
        Arc::new(Recipe {
            name: "r".into(),
            awms: vec![
                Awm { id: 0, value: 0.4, requests: Map::from([("sys0.mem0".to_string(), 128)]) },
                Awm { id: 1, value: 0.9, requests: Map::from([("sys0.mem0".to_string(), 256)]) },
            ],
            constraints: Constraints::default(),
        })
    }

    async fn setup() -> (ApplicationRegistry, ResourceAccounter, ChannelRegistry, u64) {
        let mut tree = ResourceTree::new();
        tree.register(ResourcePath::parse("sys0.mem0").unwrap(), 1024).unwrap();
        let accounter = ResourceAccounter::new(tree);
        let view = accounter.get_view("sched").await.unwrap();
        let registry = ApplicationRegistry::new();
        let uid = make_uid(1, 0);
        let mut exc = Exc::new(uid, "e1", 10, recipe());
        exc.transition(ExcState::Ready).unwrap();
        registry.register(exc).await;
        let channels = ChannelRegistry::new();
        channels.attach(uid, Arc::new(MockRtLibChannel::default())).await;
        (registry, accounter, channels, view)
    }

    #[tokio::test]
    async fn starter_transitions_to_running_and_acquires_resources() {
        let (registry, accounter, channels, view) = setup().await;
        let sync = SyncManager::new(channels);
        let uid = make_uid(1, 0);
        // The scheduler reserves resources before proposing the transition;
        // simulate that here.
        accounter
            .acquire(uid, &ResourcePath::parse("sys0.mem0").unwrap(), 256, view, true)
            .await
            .unwrap();
        let transitions = vec![ScheduledTransition {
            uid,
            from_awm: None,
            to_awm: 1,
            resource_class: ResourceChangeClass::Migrate,
            value_direction: ValueDirection::Increased,
            is_starter: true,
        }];
        let mut seed = 0;
        let outcome = sync.run_round(&registry, &accounter, view, &[], &transitions, &mut seed).await;
        assert!(outcome.failed.is_empty());
        let exc = registry.get(uid).await.unwrap();
        assert_eq!(exc.state, ExcState::Running);
        assert_eq!(exc.current_awm, Some(1));
        let used = accounter.used(&ResourcePath::parse("sys0.mem0").unwrap(), view).await.unwrap();
        assert_eq!(used, 256);
    }

    #[tokio::test]
    async fn sync_timeout_rolls_back_exc() {
        let (registry, accounter, channels, view) = setup().await;
        let uid = make_uid(1, 0);
        channels
            .attach(uid, Arc::new(MockRtLibChannel { hang_at: Some(SyncPhase::SyncChange), ..Default::default() }))
            .await;
        let sync = SyncManager::new(channels);
        accounter
            .acquire(uid, &ResourcePath::parse("sys0.mem0").unwrap(), 128, view, true)
            .await
            .unwrap();
        let transitions = vec![ScheduledTransition {
            uid,
            from_awm: None,
            to_awm: 0,
            resource_class: ResourceChangeClass::Migrate,
            value_direction: ValueDirection::Increased,
            is_starter: true,
        }];
        let mut seed = 0;
        let outcome = sync.run_round(&registry, &accounter, view, &[], &transitions, &mut seed).await;
        assert_eq!(outcome.failed.len(), 1);
        assert!(matches!(outcome.failed[0].1, RtrmError::SyncTimeout { .. }));
        let exc = registry.get(uid).await.unwrap();
        assert_eq!(exc.state, ExcState::Ready);
        let used = accounter.used(&ResourcePath::parse("sys0.mem0").unwrap(), view).await.unwrap();
        assert_eq!(used, 0);
    }

    #[tokio::test]
    async fn blocked_out_eviction_releases_resources_and_returns_to_ready() {
        let (registry, accounter, channels, view) = setup().await;
        let uid = make_uid(1, 0);
        let mem = ResourcePath::parse("sys0.mem0").unwrap();
        accounter.acquire(uid, &mem, 128, view, true).await.unwrap();
        registry
            .update(uid, |e| {
                e.begin_sync(0, SyncState::Starting)?;
                e.transition(ExcState::Running)
            })
            .await
            .unwrap();

        let sync = SyncManager::new(channels);
        let mut seed = 0;
        let outcome = sync
            .run_round(&registry, &accounter, view, &[uid], &[], &mut seed)
            .await;
        assert!(outcome.failed.is_empty());
        let exc = registry.get(uid).await.unwrap();
        assert_eq!(exc.state, ExcState::Ready);
        assert_eq!(exc.current_awm, None);
        assert_eq!(accounter.used(&mem, view).await.unwrap(), 0);
    }

    #[test]
    fn classify_change_detects_migrate_reconf_migrec() {
        let a = Awm { id: 0, value: 0.1, requests: Map::from([("sys0.cpu0".to_string(), 1)]) };
        let b = Awm { id: 1, value: 0.2, requests: Map::from([("sys0.cpu0".to_string(), 2)]) };
        assert_eq!(classify_change(Some(&a), &b), ResourceChangeClass::Reconf);

        let c = Awm { id: 2, value: 0.3, requests: Map::from([("sys0.mem0".to_string(), 2)]) };
        assert_eq!(classify_change(Some(&a), &c), ResourceChangeClass::Migrate);

        let d = Awm {
            id: 3,
            value: 0.3,
            requests: Map::from([("sys0.cpu0".to_string(), 1), ("sys0.mem0".to_string(), 1)]),
        };
        assert_eq!(classify_change(Some(&a), &d), ResourceChangeClass::Migrec);
    }
}
