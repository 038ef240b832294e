//! Resource Tree (C1): hierarchical naming of resources, with per-resource
//! totals, reservations, and online/offline tracking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{Result, RtrmError};
use crate::res::path::ResourcePath;

/// Cumulative online/offline time tracking for a single resource node.
#[derive(Debug, Clone)]
struct OnlineTimers {
    online: bool,
    since: Instant,
    cumulative_online: Duration,
    cumulative_offline: Duration,
}

impl OnlineTimers {
    fn new() -> Self {
        Self {
            online: true,
            since: Instant::now(),
            cumulative_online: Duration::ZERO,
            cumulative_offline: Duration::ZERO,
        }
    }

    fn set(&mut self, online: bool) {
        if online == self.online {
            return;
        }
        let elapsed = self.since.elapsed();
        if self.online {
            self.cumulative_online += elapsed;
        } else {
            self.cumulative_offline += elapsed;
        }
        self.online = online;
        self.since = Instant::now();
    }
}

/// A single node in the resource tree.
#[derive(Debug)]
pub struct ResourceNode {
    pub path: ResourcePath,
    pub total: u64,
    pub reserved: u64,
    timers: OnlineTimers,
}

impl ResourceNode {
    pub fn is_online(&self) -> bool {
        self.timers.online
    }

    /// Capacity available to views before any usage is subtracted:
    /// `total - reserved`, or 0 when offline.
    pub fn nominal_available(&self) -> u64 {
        if !self.is_online() {
            return 0;
        }
        self.total.saturating_sub(self.reserved)
    }

    pub fn cumulative_online_time(&self) -> Duration {
        let mut d = self.timers.cumulative_online;
        if self.timers.online {
            d += self.timers.since.elapsed();
        }
        d
    }

    pub fn cumulative_offline_time(&self) -> Duration {
        let mut d = self.timers.cumulative_offline;
        if !self.timers.online {
            d += self.timers.since.elapsed();
        }
        d
    }
}

/// Hierarchical naming of resources. Traversal is O(depth); ancestors are
/// created implicitly on `register`.
pub struct ResourceTree {
    nodes: HashMap<String, ResourceNode>,
    /// Insertion order, used for deterministic traversal by callers that
    /// need it (e.g. the scheduler driver, peer status reports).
    order: Vec<String>,
}

impl Default for ResourceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceTree {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Insert a leaf at `path`, creating all missing ancestors with total=0
    /// (ancestors are namespace-only unless separately registered).
    pub fn register(&mut self, path: ResourcePath, total: u64) -> Result<()> {
        let segments = path.segments().to_vec();
        for depth in 1..=segments.len() {
            let prefix = crate::res::path::ResourcePath::new(segments[..depth].to_vec())?;
            let key = prefix.to_dotted();
            if !self.nodes.contains_key(&key) {
                let is_leaf = depth == segments.len();
                self.nodes.insert(
                    key.clone(),
                    ResourceNode {
                        path: prefix,
                        total: if is_leaf { total } else { 0 },
                        reserved: 0,
                        timers: OnlineTimers::new(),
                    },
                );
                self.order.push(key.clone());
                debug!(path = %key, total, "resource node registered");
            } else if depth == segments.len() {
                // Re-registering a leaf updates total.
                if let Some(node) = self.nodes.get_mut(&key) {
                    node.total = total;
                }
            }
        }
        info!(path = %path.to_dotted(), total, "resource registered");
        Ok(())
    }

    pub fn get(&self, path: &ResourcePath) -> Result<&ResourceNode> {
        self.nodes
            .get(&path.to_dotted())
            .ok_or_else(|| RtrmError::NotFound(path.to_dotted()))
    }

    pub fn get_mut(&mut self, path: &ResourcePath) -> Result<&mut ResourceNode> {
        self.nodes
            .get_mut(&path.to_dotted())
            .ok_or_else(|| RtrmError::NotFound(path.to_dotted()))
    }

    pub fn set_online(&mut self, path: &ResourcePath) -> Result<()> {
        let node = self.get_mut(path)?;
        node.timers.set(true);
        info!(path = %path.to_dotted(), "resource online");
        Ok(())
    }

    pub fn set_offline(&mut self, path: &ResourcePath) -> Result<()> {
        let node = self.get_mut(path)?;
        node.timers.set(false);
        info!(path = %path.to_dotted(), "resource offline");
        Ok(())
    }

    /// Reserve `amount` out of `total`. Fails with `ResourceCapacityExceeded`
    /// if `amount > total`.
    pub fn reserve(&mut self, path: &ResourcePath, amount: u64) -> Result<()> {
        let node = self.get_mut(path)?;
        if amount > node.total {
            return Err(RtrmError::ResourceCapacityExceeded {
                path: path.to_dotted(),
                requested: amount,
                available: node.total,
            });
        }
        node.reserved = amount;
        Ok(())
    }

    /// All registered leaf paths in registration order.
    pub fn paths(&self) -> impl Iterator<Item = &ResourcePath> {
        self.order.iter().filter_map(move |k| self.nodes.get(k).map(|n| &n.path))
    }
}
