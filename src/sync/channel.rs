//! Per-EXC typed channel to the RTLib peer.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::res::path::ResourcePath;

/// One phase of the four-phase handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    PreChange,
    SyncChange,
    DoChange,
    PostChange,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncPhase::PreChange => "PreChange",
            SyncPhase::SyncChange => "SyncChange",
            SyncPhase::DoChange => "DoChange",
            SyncPhase::PostChange => "PostChange",
        };
        write!(f, "{s}")
    }
}

/// A single EXC's communication channel to its RTLib peer. `None` for
/// `next_awm` means the EXC is being evicted with no replacement (the
/// "Blocked-out" SASB class).
#[async_trait]
pub trait RtLibChannel: Send + Sync {
    /// PreChange: propose `next_awm` with `resource_set`; the peer reports
    /// its reconfiguration cost as a latency estimate in milliseconds.
    async fn pre_change(
        &self,
        token: u64,
        next_awm: Option<u32>,
        resource_set: &[(ResourcePath, u64)],
    ) -> Result<u64>;

    /// SyncChange: the peer reports whether it has reached a quiescent
    /// point. `true` = OK, `false` = FAILED.
    async fn sync_change(&self, token: u64) -> Result<bool>;

    /// DoChange: the peer must now reconfigure. No reply is expected.
    async fn do_change(&self, token: u64) -> Result<()>;

    /// PostChange: the peer reports whether it has applied the new AWM.
    async fn post_change(&self, token: u64) -> Result<bool>;
}

/// An in-memory mock RTLib peer used by tests and as the default local
/// channel when no platform integration is wired up. Always reports a
/// fixed latency estimate and succeeds every phase.
pub struct MockRtLibChannel {
    pub latency_ms: u64,
    pub fail_at: Option<SyncPhase>,
    pub hang_at: Option<SyncPhase>,
}

impl Default for MockRtLibChannel {
    fn default() -> Self {
        Self {
            latency_ms: 5,
            fail_at: None,
            hang_at: None,
        }
    }
}

#[async_trait]
impl RtLibChannel for MockRtLibChannel {
    async fn pre_change(
        &self,
        _token: u64,
        _next_awm: Option<u32>,
        _resource_set: &[(ResourcePath, u64)],
    ) -> Result<u64> {
        if self.hang_at == Some(SyncPhase::PreChange) {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
        Ok(self.latency_ms)
    }

    async fn sync_change(&self, _token: u64) -> Result<bool> {
        if self.hang_at == Some(SyncPhase::SyncChange) {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
        Ok(self.fail_at != Some(SyncPhase::SyncChange))
    }

    async fn do_change(&self, _token: u64) -> Result<()> {
        if self.hang_at == Some(SyncPhase::DoChange) {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
        Ok(())
    }

    async fn post_change(&self, _token: u64) -> Result<bool> {
        if self.hang_at == Some(SyncPhase::PostChange) {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
        Ok(self.fail_at != Some(SyncPhase::PostChange))
    }
}

/// Registry of per-EXC channels, keyed by uid.
#[derive(Clone)]
pub struct ChannelRegistry {
    channels: Arc<RwLock<HashMap<u64, Arc<dyn RtLibChannel>>>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn attach(&self, uid: u64, channel: Arc<dyn RtLibChannel>) {
        self.channels.write().await.insert(uid, channel);
    }

    pub async fn get(&self, uid: u64) -> Option<Arc<dyn RtLibChannel>> {
        self.channels.read().await.get(&uid).cloned()
    }

    pub async fn detach(&self, uid: u64) {
        self.channels.write().await.remove(&uid);
    }
}
