//! Local Platform Proxy (C7): the seam between the resource tree and the
//! actual host. `LocalPlatformProxy::refresh` polls host CPU/RAM via
//! `sysinfo` to compute the resource tree's online capacity, the way a
//! resource governor polls host RAM to compute a pressure level.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::System;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::res::accounter::ResourceAccounter;
use crate::res::path::{PathSegment, ResourceId, ResourcePath, ResourceType};

/// Result of one `Refresh()` poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshReport {
    pub cpu_total: u64,
    pub mem_total_bytes: u64,
    pub changed: bool,
}

/// Platform-facing operations the Resource Manager drives.
#[async_trait]
pub trait PlatformProxy: Send + Sync {
    /// Load the static platform description (total CPU/memory) into the
    /// resource tree. Called once at startup.
    async fn load_platform_data(&self) -> Result<()>;

    /// Re-poll the host and update the tree's totals/online state,
    /// returning whether anything changed since the last call.
    async fn refresh(&self) -> Result<RefreshReport>;

    /// Notify the platform that `uid` has been bound to `path` with
    /// `amount` units (e.g. to pin a cpuset). The local proxy has no
    /// enforcement mechanism of its own and only records the intent.
    async fn setup(&self, uid: u64, path: &ResourcePath, amount: u64) -> Result<()>;

    /// Undo a prior `setup` for `uid`.
    async fn release(&self, uid: u64) -> Result<()>;

    /// Map a (possibly remote) resource path onto this platform's local
    /// naming. The local proxy simply forces the leading system id to 0.
    fn map_resources(&self, path: &ResourcePath) -> ResourcePath {
        path.rewrite_to_local_system()
    }
}

/// Local, single-host platform proxy backed by `sysinfo`.
pub struct LocalPlatformProxy {
    accounter: Arc<ResourceAccounter>,
    sys: Mutex<System>,
    cpu_path: ResourcePath,
    mem_path: ResourcePath,
}

impl LocalPlatformProxy {
    pub fn new(accounter: Arc<ResourceAccounter>) -> Self {
        let cpu_path = ResourcePath::new(vec![
            PathSegment { kind: ResourceType::System, id: ResourceId::Id(0) },
            PathSegment { kind: ResourceType::Cpu, id: ResourceId::Id(0) },
        ])
        .expect("static path is well formed");
        let mem_path = ResourcePath::new(vec![
            PathSegment { kind: ResourceType::System, id: ResourceId::Id(0) },
            PathSegment { kind: ResourceType::Memory, id: ResourceId::Id(0) },
        ])
        .expect("static path is well formed");
        Self {
            accounter,
            sys: Mutex::new(System::new()),
            cpu_path,
            mem_path,
        }
    }
}

#[async_trait]
impl PlatformProxy for LocalPlatformProxy {
    async fn load_platform_data(&self) -> Result<()> {
        let mut sys = self.sys.lock().await;
        sys.refresh_cpu_all();
        sys.refresh_memory();
        let cpu_total = sys.cpus().len().max(1) as u64;
        let mem_total = sys.total_memory();
        drop(sys);

        self.accounter
            .with_tree_mut(|tree| -> Result<()> {
                tree.register(self.cpu_path.clone(), cpu_total)?;
                tree.register(self.mem_path.clone(), mem_total)?;
                Ok(())
            })
            .await?;
        info!(cpu_total, mem_total, "platform data loaded");
        Ok(())
    }

    async fn refresh(&self) -> Result<RefreshReport> {
        let mut sys = self.sys.lock().await;
        sys.refresh_cpu_all();
        sys.refresh_memory();
        let cpu_total = sys.cpus().len().max(1) as u64;
        let mem_total = sys.total_memory();
        drop(sys);

        let (old_cpu, old_mem) = self
            .accounter
            .with_tree(|tree| {
                (
                    tree.get(&self.cpu_path).map(|n| n.total).unwrap_or(0),
                    tree.get(&self.mem_path).map(|n| n.total).unwrap_or(0),
                )
            })
            .await;

        self.accounter
            .with_tree_mut(|tree| -> Result<()> {
                tree.register(self.cpu_path.clone(), cpu_total)?;
                tree.register(self.mem_path.clone(), mem_total)?;
                Ok(())
            })
            .await?;

        let changed = old_cpu != cpu_total || old_mem != mem_total;
        if changed {
            debug!(cpu_total, mem_total, "platform refresh detected a capacity change");
        }
        Ok(RefreshReport { cpu_total, mem_total_bytes: mem_total, changed })
    }

    async fn setup(&self, uid: u64, path: &ResourcePath, amount: u64) -> Result<()> {
        debug!(uid, path = %path.to_dotted(), amount, "platform setup (no-op enforcement)");
        Ok(())
    }

    async fn release(&self, uid: u64) -> Result<()> {
        debug!(uid, "platform release (no-op enforcement)");
        Ok(())
    }
}

/// Event emitted by the background refresh loop.
#[derive(Debug, Clone, Copy)]
pub enum PlatformEvent {
    Refreshed(RefreshReport),
}

/// Background polling loop: poll on a fixed interval and forward a
/// `PlatformEvent` whenever the platform reports a capacity change.
pub async fn run_platform_refresh_loop(
    proxy: Arc<LocalPlatformProxy>,
    interval: Duration,
    events: mpsc::Sender<PlatformEvent>,
) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tick.tick().await;
        match proxy.refresh().await {
            Ok(report) => {
                if report.changed && events.send(PlatformEvent::Refreshed(report)).await.is_err() {
                    warn!("platform refresh loop: receiver dropped, stopping");
                    return;
                }
            }
            Err(e) => warn!(err = %e, "platform refresh failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::res::tree::ResourceTree;

    #[tokio::test]
    async fn load_platform_data_populates_cpu_and_mem_nodes() {
        let accounter = Arc::new(ResourceAccounter::new(ResourceTree::new()));
        let proxy = LocalPlatformProxy::new(accounter.clone());
        proxy.load_platform_data().await.unwrap();
        let total = accounter.total(&proxy.cpu_path).await.unwrap();
        assert!(total >= 1);
    }

    #[tokio::test]
    async fn refresh_reports_no_change_on_second_call() {
        let accounter = Arc::new(ResourceAccounter::new(ResourceTree::new()));
        let proxy = LocalPlatformProxy::new(accounter.clone());
        proxy.load_platform_data().await.unwrap();
        proxy.refresh().await.unwrap();
        let second = proxy.refresh().await.unwrap();
        assert!(!second.changed);
    }

    #[tokio::test]
    async fn map_resources_rewrites_to_local_system() {
        let accounter = Arc::new(ResourceAccounter::new(ResourceTree::new()));
        let proxy = LocalPlatformProxy::new(accounter);
        let remote = ResourcePath::parse("sys3.mem0").unwrap();
        let mapped = proxy.map_resources(&remote);
        assert_eq!(mapped.to_dotted(), "sys0.mem0");
    }
}
