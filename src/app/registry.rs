//! Application Registry (C4): lifecycle state machine for every EXC, with
//! priority-grouped queues so the sync manager and scheduler iterate in
//! deterministic order.
//!
//! A `BinaryHeap` ordered by priority with FIFO tie-break, generalized here
//! to index EXCs by lifecycle state as well as priority.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::app::exc::{Exc, ExcState};
use crate::error::{Result, RtrmError};

/// Thread-safe registry of all EXCs known to this instance.
pub struct ApplicationRegistry {
    exc: RwLock<HashMap<u64, Exc>>,
}

impl Default for ApplicationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationRegistry {
    pub fn new() -> Self {
        Self {
            exc: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, exc: Exc) {
        info!(uid = exc.uid, name = %exc.name, "exc registered");
        self.exc.write().await.insert(exc.uid, exc);
    }

    pub async fn get(&self, uid: u64) -> Result<Exc> {
        self.exc
            .read()
            .await
            .get(&uid)
            .cloned()
            .ok_or_else(|| RtrmError::NotFound(format!("exc {uid}")))
    }

    pub async fn update<F>(&self, uid: u64, f: F) -> Result<()>
    where
        F: FnOnce(&mut Exc) -> Result<()>,
    {
        let mut map = self.exc.write().await;
        let exc = map
            .get_mut(&uid)
            .ok_or_else(|| RtrmError::NotFound(format!("exc {uid}")))?;
        f(exc)
    }

    /// Remove an EXC. Only legal once it has reached `Finished`.
    pub async fn remove(&self, uid: u64) -> Result<()> {
        let mut map = self.exc.write().await;
        match map.get(&uid) {
            Some(exc) if exc.state == ExcState::Finished => {
                map.remove(&uid);
                debug!(uid, "exc removed from registry");
                Ok(())
            }
            Some(exc) => Err(RtrmError::Lifecycle {
                uid,
                from: format!("{:?}", exc.state),
                to: "removed".to_string(),
            }),
            None => Err(RtrmError::NotFound(format!("exc {uid}"))),
        }
    }

    /// All EXCs in `state`, grouped and ordered by descending priority, then
    /// ascending uid for determinism.
    pub async fn by_state(&self, state: ExcState) -> Vec<Exc> {
        let map = self.exc.read().await;
        let mut v: Vec<Exc> = map.values().filter(|e| e.state == state).cloned().collect();
        v.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.uid.cmp(&b.uid)));
        v
    }

    pub async fn all(&self) -> Vec<Exc> {
        let map = self.exc.read().await;
        let mut v: Vec<Exc> = map.values().cloned().collect();
        v.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.uid.cmp(&b.uid)));
        v
    }

    pub async fn len(&self) -> usize {
        self.exc.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.exc.read().await.is_empty()
    }
}

pub type SharedRegistry = Arc<ApplicationRegistry>;
