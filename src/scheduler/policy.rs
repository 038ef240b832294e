//! The Scheduler Driver's pluggable decision-making capability.

use async_trait::async_trait;

use crate::app::{Exc, ExcState};
use crate::error::Result;
use crate::res::accounter::ResourceAccounter;

/// Everything a policy needs to decide bindings for one round: the set of
/// EXCs competing this round and a read-only handle onto the working view's
/// availability.
pub struct ScheduleContext<'a> {
    pub exc: Vec<Exc>,
    pub accounter: &'a ResourceAccounter,
    pub view: u64,
}

impl<'a> ScheduleContext<'a> {
    pub fn new(exc: Vec<Exc>, accounter: &'a ResourceAccounter, view: u64) -> Self {
        Self { exc, accounter, view }
    }

    /// EXCs eligible to be (re)bound this round: `Ready` (starters) and
    /// `Running` (candidates for a better AWM or for eviction).
    pub fn eligible(&self) -> Vec<&Exc> {
        self.exc
            .iter()
            .filter(|e| matches!(e.state, ExcState::Ready | ExcState::Running))
            .collect()
    }
}

/// One policy's proposal: which AWM to bind each chosen EXC to, and which
/// currently-running EXCs must be evicted with no replacement this round.
#[derive(Debug, Default, Clone)]
pub struct ScheduleDecision {
    pub bindings: Vec<(u64, u32)>,
    pub blocked_out: Vec<u64>,
}

impl ScheduleDecision {
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty() && self.blocked_out.is_empty()
    }
}

#[async_trait]
pub trait Policy: Send + Sync {
    async fn schedule(&self, ctx: &ScheduleContext<'_>) -> Result<ScheduleDecision>;

    fn name(&self) -> &str;
}
