//! Peer Directory (C8): discovery, ping/availability statistics, and
//! id↔address mapping. Each tick runs as a `tokio` task rather than a
//! dedicated worker thread.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Result, RtrmError};
use crate::peer::address::build_ip_addresses;

/// Number of pings sent per peer on each tick.
pub const PING_NUMBER: usize = 3;
/// Number of ping cycles kept in the rolling RTT/availability window.
pub const PING_CYCLES: usize = 3;
const RING_LEN: usize = PING_NUMBER * PING_CYCLES;

const DISCOVER_TIMEOUT: Duration = Duration::from_secs(2);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Role advertised by a peer in its `Discover` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Master,
    Slave,
}

#[derive(Debug, Clone)]
pub struct DiscoverReply {
    pub role: PeerRole,
    pub assigned_id: u16,
}

/// Everything the Peer Directory needs from the Agent RPC client, kept
/// abstract so the directory can be tested without a real socket.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn discover(&self, addr: Ipv4Addr, caller_role: PeerRole) -> Result<DiscoverReply>;

    /// `Ok(Some(latency_ms))` on a successful ping, `Ok(None)` on an explicit
    /// FAIL reply. An `Err` (connection refused, etc.) is treated by the
    /// directory the same way as a FAIL.
    async fn ping(&self, addr: Ipv4Addr, sender_id: u16) -> Result<Option<u64>>;
}

/// One tracked peer: its id, address, and rolling ping history.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub id: u16,
    pub addr: Ipv4Addr,
    pub role: PeerRole,
    samples: VecDeque<Option<u64>>,
    pub slow: bool,
}

impl PeerEntry {
    fn new(id: u16, addr: Ipv4Addr, role: PeerRole) -> Self {
        Self { id, addr, role, samples: VecDeque::with_capacity(RING_LEN), slow: false }
    }

    fn record(&mut self, sample: Option<u64>) {
        if self.samples.len() == RING_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.recompute();
    }

    fn recompute(&mut self) {
        let successes: Vec<u64> = self.samples.iter().filter_map(|s| *s).collect();
        let full_cycle = self.samples.len() == RING_LEN;
        self.slow = full_cycle && successes.is_empty();
    }

    /// Mean round-trip time over the retained samples, `None` if every
    /// sample so far has failed.
    pub fn mean_rtt_ms(&self) -> Option<f64> {
        let successes: Vec<u64> = self.samples.iter().filter_map(|s| *s).collect();
        if successes.is_empty() {
            return None;
        }
        Some(successes.iter().sum::<u64>() as f64 / successes.len() as f64)
    }

    /// Percentage (0.0–100.0) of retained samples that succeeded.
    pub fn availability(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let successes = self.samples.iter().filter(|s| s.is_some()).count();
        100.0 * successes as f64 / self.samples.len() as f64
    }
}

struct DirectoryState {
    peers: HashMap<u16, PeerEntry>,
}

impl DirectoryState {
    fn lowest_free_id(&self) -> u16 {
        let mut candidate: u16 = 1;
        while self.peers.contains_key(&candidate) {
            candidate += 1;
        }
        candidate
    }

    fn id_for_addr(&self, addr: Ipv4Addr) -> Option<u16> {
        self.peers.iter().find(|(_, p)| p.addr == addr).map(|(id, _)| *id)
    }
}

/// Background peer directory. Cheaply cloneable — all clones share state.
pub struct PeerDirectory {
    transport: Arc<dyn PeerTransport>,
    local_addr: Ipv4Addr,
    range: (Ipv4Addr, Ipv4Addr),
    hierarchical: bool,
    is_master: bool,
    state: Mutex<DirectoryState>,
}

impl PeerDirectory {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        local_addr: Ipv4Addr,
        range: (Ipv4Addr, Ipv4Addr),
        hierarchical: bool,
        is_master: bool,
    ) -> Self {
        Self {
            transport,
            local_addr,
            range,
            hierarchical,
            is_master,
            state: Mutex::new(DirectoryState { peers: HashMap::new() }),
        }
    }

    fn local_role(&self) -> PeerRole {
        if self.hierarchical && self.is_master {
            PeerRole::Master
        } else {
            PeerRole::Slave
        }
    }

    /// One discover+ping tick. Dispatches one task per candidate
    /// address and joins them all before returning, per the concurrency note
    /// "the worker thread joins all dispatched tasks before reporting".
    pub async fn tick(&self) -> Result<()> {
        self.discover_phase().await?;
        self.ping_phase().await;
        Ok(())
    }

    async fn discover_phase(&self) -> Result<()> {
        let candidates: Vec<Ipv4Addr> = build_ip_addresses(self.range.0, self.range.1)?
            .into_iter()
            .filter(|a| *a != self.local_addr)
            .collect();

        let caller_role = self.local_role();
        let replies = join_all(candidates.iter().map(|addr| {
            let transport = self.transport.clone();
            let addr = *addr;
            async move {
                let result = tokio::time::timeout(DISCOVER_TIMEOUT, transport.discover(addr, caller_role)).await;
                (addr, result)
            }
        }))
        .await;

        let mut state = self.state.lock().await;
        let mut responded = std::collections::HashSet::new();
        let mut master_seen = self.is_master && self.hierarchical;

        for (addr, result) in replies {
            let reply = match result {
                Ok(Ok(reply)) => reply,
                // Timeout ⇒ not discovered.
                Ok(Err(_)) | Err(_) => continue,
            };
            responded.insert(addr);

            if self.hierarchical && reply.role == PeerRole::Master {
                if master_seen {
                    return Err(RtrmError::ConfigInvalid(
                        "duplicate master detected among discovered peers".into(),
                    ));
                }
                master_seen = true;
            }

            match state.id_for_addr(addr) {
                Some(_) => {}
                None => {
                    let id = state.lowest_free_id();
                    state.peers.insert(id, PeerEntry::new(id, addr, reply.role));
                    info!(%addr, id, "peer discovered");
                }
            }
        }

        let stale: Vec<u16> = state
            .peers
            .iter()
            .filter(|(_, p)| !responded.contains(&p.addr))
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            state.peers.remove(&id);
            info!(id, "peer removed, no longer responding to discover");
        }

        Ok(())
    }

    async fn ping_phase(&self) {
        let peer_addrs: Vec<(u16, Ipv4Addr)> = {
            let state = self.state.lock().await;
            state.peers.values().map(|p| (p.id, p.addr)).collect()
        };

        let all_samples = join_all(peer_addrs.iter().map(|&(id, addr)| {
            let transport = self.transport.clone();
            async move {
                let mut samples = Vec::with_capacity(PING_NUMBER);
                for _ in 0..PING_NUMBER {
                    let sample = match tokio::time::timeout(PING_TIMEOUT, transport.ping(addr, 0)).await {
                        Ok(Ok(latency)) => latency,
                        Ok(Err(_)) | Err(_) => None,
                    };
                    samples.push(sample);
                }
                (id, samples)
            }
        }))
        .await;

        let mut state = self.state.lock().await;
        for (id, samples) in all_samples {
            if let Some(peer) = state.peers.get_mut(&id) {
                for sample in samples {
                    peer.record(sample);
                }
                if peer.slow {
                    warn!(id, addr = %peer.addr, "peer tagged slow, 0% availability over a full cycle");
                }
            }
        }
    }

    pub async fn peers(&self) -> Vec<PeerEntry> {
        self.state.lock().await.peers.values().cloned().collect()
    }

    pub async fn addr_for_id(&self, id: u16) -> Option<Ipv4Addr> {
        self.state.lock().await.peers.get(&id).map(|p| p.addr)
    }

    pub async fn id_for_addr(&self, addr: Ipv4Addr) -> Option<u16> {
        self.state.lock().await.id_for_addr(addr)
    }
}

/// Background tick loop: fixed-interval polling where the period is
/// `gcd(discover, ping)`.
pub async fn run_peer_directory_loop(directory: Arc<PeerDirectory>, period: Duration) {
    let mut tick = tokio::time::interval(period);
    loop {
        tick.tick().await;
        if let Err(e) = directory.tick().await {
            warn!(err = %e, "peer directory tick failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct MockTransport {
        reachable: Vec<Ipv4Addr>,
        latency_ms: u64,
        fail_ping_for: Vec<Ipv4Addr>,
        calls: AtomicU64,
    }

    #[async_trait]
    impl PeerTransport for MockTransport {
        async fn discover(&self, addr: Ipv4Addr, _caller_role: PeerRole) -> Result<DiscoverReply> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.reachable.contains(&addr) {
                Ok(DiscoverReply { role: PeerRole::Slave, assigned_id: 0 })
            } else {
                Err(RtrmError::PeerUnreachable { id: 0, reason: addr.to_string() })
            }
        }

        async fn ping(&self, addr: Ipv4Addr, _sender_id: u16) -> Result<Option<u64>> {
            if self.fail_ping_for.contains(&addr) {
                Ok(None)
            } else {
                Ok(Some(self.latency_ms))
            }
        }
    }

    #[tokio::test]
    async fn discovers_responding_peers_and_skips_local_address() {
        let local = Ipv4Addr::new(10, 0, 0, 6);
        let transport = Arc::new(MockTransport {
            reachable: vec![Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 7)],
            latency_ms: 10,
            fail_ping_for: vec![],
            calls: AtomicU64::new(0),
        });
        let dir = PeerDirectory::new(
            transport,
            local,
            (Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 8)),
            false,
            false,
        );
        dir.tick().await.unwrap();
        let peers = dir.peers().await;
        assert_eq!(peers.len(), 2);
        let mut ids: Vec<u16> = peers.iter().map(|p| p.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn non_responders_are_removed_on_next_tick() {
        let local = Ipv4Addr::new(10, 0, 0, 6);
        let transport = Arc::new(MockTransport {
            reachable: vec![Ipv4Addr::new(10, 0, 0, 5)],
            latency_ms: 5,
            fail_ping_for: vec![],
            calls: AtomicU64::new(0),
        });
        let dir = PeerDirectory::new(
            transport,
            local,
            (Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 5)),
            false,
            false,
        );
        dir.tick().await.unwrap();
        assert_eq!(dir.peers().await.len(), 1);

        // Swap in a transport where the previously-discovered peer is gone.
        let empty_transport = Arc::new(MockTransport {
            reachable: vec![],
            latency_ms: 5,
            fail_ping_for: vec![],
            calls: AtomicU64::new(0),
        });
        let dir2 = PeerDirectory::new(
            empty_transport,
            local,
            (Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 5)),
            false,
            false,
        );
        dir2.tick().await.unwrap();
        assert!(dir2.peers().await.is_empty());
    }

    #[tokio::test]
    async fn zero_successful_pings_tags_peer_slow_with_no_rtt() {
        let local = Ipv4Addr::new(10, 0, 0, 6);
        let peer_addr = Ipv4Addr::new(10, 0, 0, 5);
        let transport = Arc::new(MockTransport {
            reachable: vec![peer_addr],
            latency_ms: 0,
            fail_ping_for: vec![peer_addr],
            calls: AtomicU64::new(0),
        });
        let dir = PeerDirectory::new(transport, local, (peer_addr, peer_addr), false, false);
        for _ in 0..PING_CYCLES {
            dir.tick().await.unwrap();
        }
        let peers = dir.peers().await;
        assert_eq!(peers.len(), 1);
        assert!(peers[0].slow);
        assert_eq!(peers[0].mean_rtt_ms(), None);
        assert_eq!(peers[0].availability(), 0.0);
    }

    #[tokio::test]
    async fn healthy_peer_reports_full_availability_and_mean_rtt() {
        let local = Ipv4Addr::new(10, 0, 0, 6);
        let peer_addr = Ipv4Addr::new(10, 0, 0, 5);
        let transport = Arc::new(MockTransport {
            reachable: vec![peer_addr],
            latency_ms: 12,
            fail_ping_for: vec![],
            calls: AtomicU64::new(0),
        });
        let dir = PeerDirectory::new(transport, local, (peer_addr, peer_addr), false, false);
        dir.tick().await.unwrap();
        let peers = dir.peers().await;
        assert_eq!(peers[0].mean_rtt_ms(), Some(12.0));
        assert_eq!(peers[0].availability(), 100.0);
        assert!(!peers[0].slow);
    }

    #[tokio::test]
    async fn duplicate_master_is_fatal_in_hierarchical_mode() {
        let local = Ipv4Addr::new(10, 0, 0, 6);
        let peer_addr = Ipv4Addr::new(10, 0, 0, 5);

        struct MasterTransport;
        #[async_trait]
        impl PeerTransport for MasterTransport {
            async fn discover(&self, _addr: Ipv4Addr, _caller_role: PeerRole) -> Result<DiscoverReply> {
                Ok(DiscoverReply { role: PeerRole::Master, assigned_id: 0 })
            }
            async fn ping(&self, _addr: Ipv4Addr, _sender_id: u16) -> Result<Option<u64>> {
                Ok(Some(1))
            }
        }

        let dir = PeerDirectory::new(Arc::new(MasterTransport), local, (peer_addr, peer_addr), true, true);
        let err = dir.tick().await;
        assert!(matches!(err, Err(RtrmError::ConfigInvalid(_))));
    }
}
