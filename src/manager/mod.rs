//! Resource Manager (C10): the single-writer event loop that demultiplexes
//! the event set — `PLAT_REFRESH, NEW_APP, APP_EXIT, PEER_JOIN, USER_CMD` —
//! onto the Scheduler Driver, the Accounter, and the Application Registry.
//! A single `mpsc` channel feeds the loop, rather than a socket or reconnect
//! task of any kind.
//!
//! Events queue behind the channel; the loop awaits them one at a time, so
//! the handlers below never need to guard against reentrancy themselves.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::app::registry::ApplicationRegistry;
use crate::app::{Exc, ExcState};
use crate::error::Result;
use crate::ipc::event::{ManagerEvent, ManagerNotification, UserCommand};
use crate::ipc::EventBroadcaster;
use crate::res::accounter::{ResourceAccounter, COMMITTED_VIEW};
use crate::scheduler::SchedulerDriver;
use crate::sync::channel::{ChannelRegistry, MockRtLibChannel};

/// Ties the core components together and answers one `ManagerEvent` at a
/// time.
pub struct ResourceManager {
    registry: Arc<ApplicationRegistry>,
    accounter: Arc<ResourceAccounter>,
    driver: Arc<SchedulerDriver>,
    channels: ChannelRegistry,
    broadcaster: Arc<EventBroadcaster>,
}

impl ResourceManager {
    pub fn new(
        registry: Arc<ApplicationRegistry>,
        accounter: Arc<ResourceAccounter>,
        driver: Arc<SchedulerDriver>,
        channels: ChannelRegistry,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self { registry, accounter, driver, channels, broadcaster }
    }

    /// Drain `events` until the channel closes or a `Shutdown` command is
    /// handled.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ManagerEvent>) {
        while let Some(event) = events.recv().await {
            let shutdown = matches!(event, ManagerEvent::UserCmd(UserCommand::Shutdown));
            self.handle(event).await;
            if shutdown {
                break;
            }
        }
        info!("resource manager loop exited");
    }

    async fn handle(&self, event: ManagerEvent) {
        match event {
            ManagerEvent::PlatRefresh(report) => {
                self.broadcaster.publish(ManagerNotification::PlatRefresh {
                    cpu_total: report.cpu_total,
                    mem_total_bytes: report.mem_total_bytes,
                });
                self.run_schedule_round().await;
            }
            ManagerEvent::NewApp(exc) => self.handle_new_app(exc).await,
            ManagerEvent::AppExit(uid) => self.handle_app_exit(uid).await,
            ManagerEvent::PeerJoin(id) => {
                self.broadcaster.publish(ManagerNotification::PeerJoin { id });
            }
            ManagerEvent::UserCmd(UserCommand::ReloadConfig) => {
                info!("config reload requested");
            }
            ManagerEvent::UserCmd(UserCommand::Shutdown) => {
                self.broadcaster.publish(ManagerNotification::Shutdown);
                info!("shutdown requested");
            }
        }
    }

    async fn handle_new_app(&self, mut exc: Exc) {
        let uid = exc.uid;
        if let Err(e) = exc.transition(ExcState::Ready) {
            warn!(uid, err = %e, "new exc rejected: illegal initial transition");
            return;
        }
        self.registry.register(exc).await;
        self.channels.attach(uid, Arc::new(MockRtLibChannel::default())).await;
        self.broadcaster.publish(ManagerNotification::NewApp { uid });
        info!(uid, "exc admitted, running a scheduling round");
        self.run_schedule_round().await;
    }

    async fn handle_app_exit(&self, uid: u64) {
        if let Err(e) = self.release_committed_holdings(uid).await {
            warn!(uid, err = %e, "failed to release committed holdings on exit");
        }

        // Exit is application-driven, not scheduler-driven, so it isn't
        // constrained by the lifecycle graph's scheduler/sync arcs: an
        // application may disappear from any state, including Ready (never
        // scheduled) or Disabled (never admitted).
        let result = self.registry.update(uid, |exc| {
            if exc.state == ExcState::Sync {
                exc.rollback_sync()?;
            }
            match exc.state {
                ExcState::Running => exc.transition(ExcState::Finished),
                ExcState::Finished => Ok(()),
                _ => {
                    exc.state = ExcState::Finished;
                    exc.current_awm = None;
                    exc.next_awm = None;
                    exc.sync_state = crate::app::SyncState::None;
                    Ok(())
                }
            }
        }).await;
        if let Err(e) = result {
            warn!(uid, err = %e, "exc exit transition failed");
            return;
        }

        self.channels.detach(uid).await;
        if let Err(e) = self.registry.remove(uid).await {
            warn!(uid, err = %e, "failed to remove exited exc from registry");
        }
        self.broadcaster.publish(ManagerNotification::AppExit { uid });
        self.run_schedule_round().await;
    }

    /// Release whatever the EXC holds in the committed view directly — no
    /// working view is needed since the EXC is leaving the system, not being
    /// rebound within a round.
    async fn release_committed_holdings(&self, uid: u64) -> Result<()> {
        let exc = match self.registry.get(uid).await {
            Ok(exc) => exc,
            Err(_) => return Ok(()), // already gone
        };
        if let Some(awm_id) = exc.current_awm {
            let bound = exc.recipe.bind(awm_id)?;
            for (path, _) in &bound.requests {
                self.accounter.release(uid, path, COMMITTED_VIEW).await?;
            }
        }
        Ok(())
    }

    async fn run_schedule_round(&self) {
        match self.driver.run_once().await {
            Ok(outcome) => {
                self.broadcaster.publish(ManagerNotification::SyncDone {
                    succeeded: outcome.succeeded.len(),
                    failed: outcome.failed.len(),
                });
                if outcome.partially_failed() {
                    warn!(failed = outcome.failed.len(), "scheduling round had partial failures");
                }
            }
            Err(e) => warn!(err = %e, "scheduling round aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::recipe::{Awm, Constraints, Recipe};
    use crate::app::make_uid;
    use crate::res::path::ResourcePath;
    use crate::res::tree::ResourceTree;
    use crate::scheduler::policies::greedy::GreedyPolicy;
    use crate::sync::SyncManager;
    use std::collections::HashMap;

    fn recipe() -> Arc<Recipe> {
        Arc::new(Recipe {
            name: "r".into(),
            awms: vec![Awm { id: 0, value: 0.5, requests: HashMap::from([("sys0.mem0".to_string(), 128)]) }],
            constraints: Constraints::default(),
        })
    }

    fn manager() -> (Arc<ResourceManager>, Arc<ApplicationRegistry>, Arc<ResourceAccounter>) {
        let mut tree = ResourceTree::new();
        tree.register(ResourcePath::parse("sys0.mem0").unwrap(), 1024).unwrap();
        let accounter = Arc::new(ResourceAccounter::new(tree));
        let registry = Arc::new(ApplicationRegistry::new());
        let channels = ChannelRegistry::new();
        let sync = Arc::new(SyncManager::new(channels.clone()));
        let policy = Arc::new(GreedyPolicy::new());
        let driver = Arc::new(SchedulerDriver::new(accounter.clone(), registry.clone(), sync, policy));
        let broadcaster = Arc::new(EventBroadcaster::new());
        let manager = Arc::new(ResourceManager::new(registry.clone(), accounter.clone(), driver, channels, broadcaster));
        (manager, registry, accounter)
    }

    #[tokio::test]
    async fn new_app_event_admits_and_schedules_the_exc() {
        let (manager, registry, _accounter) = manager();
        let (tx, rx) = mpsc::channel(8);
        let uid = make_uid(1, 0);
        tx.send(ManagerEvent::NewApp(Exc::new(uid, "e1", 5, recipe()))).await.unwrap();
        drop(tx);
        manager.run(rx).await;

        let exc = registry.get(uid).await.unwrap();
        assert_eq!(exc.state, ExcState::Running);
        assert_eq!(exc.current_awm, Some(0));
    }

    #[tokio::test]
    async fn app_exit_releases_resources_and_removes_the_exc() {
        let (manager, registry, accounter) = manager();
        let (tx, rx) = mpsc::channel(8);
        let uid = make_uid(2, 0);
        tx.send(ManagerEvent::NewApp(Exc::new(uid, "e1", 5, recipe()))).await.unwrap();
        tx.send(ManagerEvent::AppExit(uid)).await.unwrap();
        drop(tx);
        manager.run(rx).await;

        assert!(registry.get(uid).await.is_err());
        let used = accounter.used(&ResourcePath::parse("sys0.mem0").unwrap(), COMMITTED_VIEW).await.unwrap();
        assert_eq!(used, 0);
    }

    #[tokio::test]
    async fn shutdown_command_stops_the_loop() {
        let (manager, _registry, _accounter) = manager();
        let (tx, rx) = mpsc::channel(8);
        tx.send(ManagerEvent::UserCmd(UserCommand::Shutdown)).await.unwrap();
        // A run() that returns at all (rather than hanging) proves the
        // shutdown command broke the loop before `tx` was dropped.
        manager.run(rx).await;
    }
}
