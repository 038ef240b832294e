//! A value-maximizing greedy policy: each eligible EXC, visited in priority
//! order, is offered its highest-value AWM that still fits; failing that its
//! lowest-value AWM; failing that a running EXC is blocked out.
//!
//! Generalized from a single scalar capacity budget to the per-path
//! resource tree: accept while capacity remains along every path an AWM
//! touches, stop once one of them doesn't.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use crate::app::{Awm, Exc, ExcState};
use crate::error::Result;
use crate::res::path::ResourcePath;
use crate::scheduler::policy::{Policy, ScheduleContext, ScheduleDecision};

pub struct GreedyPolicy;

impl Default for GreedyPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl GreedyPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Whether `awm`'s requests fit given what's already available plus what
    /// this round has tentatively staged for other EXCs so far.
    async fn fits(
        &self,
        exc: &Exc,
        awm: &Awm,
        ctx: &ScheduleContext<'_>,
        staged: &HashMap<String, u64>,
    ) -> Result<bool> {
        for (path, amount) in &awm.requests {
            let parsed = ResourcePath::parse(path)?;
            let avail = ctx.accounter.available(&parsed, ctx.view, Some(exc.uid)).await?;
            let already_staged = staged.get(path).copied().unwrap_or(0);
            if *amount > avail.saturating_sub(already_staged) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn stage(&self, awm: &Awm, staged: &mut HashMap<String, u64>) {
        for (path, amount) in &awm.requests {
            *staged.entry(path.clone()).or_insert(0) += amount;
        }
    }
}

#[async_trait]
impl Policy for GreedyPolicy {
    async fn schedule(&self, ctx: &ScheduleContext<'_>) -> Result<ScheduleDecision> {
        let mut decision = ScheduleDecision::default();
        let mut staged: HashMap<String, u64> = HashMap::new();

        for exc in ctx.eligible() {
            let candidates = [exc.recipe.high_value_awm(), exc.recipe.low_value_awm()];
            let mut bound = false;
            for candidate in candidates.into_iter().flatten() {
                if self.fits(exc, candidate, ctx, &staged).await? {
                    self.stage(candidate, &mut staged);
                    decision.bindings.push((exc.uid, candidate.id));
                    bound = true;
                    break;
                }
            }
            if !bound {
                if exc.state == ExcState::Running {
                    debug!(uid = exc.uid, "no awm fits, blocking out");
                    decision.blocked_out.push(exc.uid);
                } else {
                    debug!(uid = exc.uid, "no awm fits, leaving ready for next round");
                }
            }
        }

        Ok(decision)
    }

    fn name(&self) -> &str {
        "greedy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::recipe::{Constraints, Recipe};
    use crate::app::make_uid;
    use crate::res::accounter::ResourceAccounter;
    use crate::res::tree::ResourceTree;
    use std::sync::Arc;

    fn recipe() -> Arc<Recipe> {
        Arc::new(Recipe {
            name: "r".into(),
            awms: vec![
                Awm { id: 0, value: 0.3, requests: HashMap::from([("sys0.mem0".to_string(), 200)]) },
                Awm { id: 1, value: 0.9, requests: HashMap::from([("sys0.mem0".to_string(), 900)]) },
            ],
            constraints: Constraints::default(),
        })
    }

    #[tokio::test]
    async fn picks_high_value_awm_when_it_fits() {
        let mut tree = ResourceTree::new();
        tree.register(ResourcePath::parse("sys0.mem0").unwrap(), 1024).unwrap();
        let accounter = ResourceAccounter::new(tree);
        let view = accounter.get_view("t").await.unwrap();
        let mut exc = Exc::new(make_uid(1, 0), "e", 5, recipe());
        exc.transition(ExcState::Ready).unwrap();
        let ctx = ScheduleContext::new(vec![exc], &accounter, view);

        let decision = GreedyPolicy::new().schedule(&ctx).await.unwrap();
        assert_eq!(decision.bindings, vec![(make_uid(1, 0), 1)]);
        assert!(decision.blocked_out.is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_low_value_awm_when_high_value_does_not_fit() {
        let mut tree = ResourceTree::new();
        tree.register(ResourcePath::parse("sys0.mem0").unwrap(), 512).unwrap();
        let accounter = ResourceAccounter::new(tree);
        let view = accounter.get_view("t").await.unwrap();
        let mut exc = Exc::new(make_uid(1, 0), "e", 5, recipe());
        exc.transition(ExcState::Ready).unwrap();
        let ctx = ScheduleContext::new(vec![exc], &accounter, view);

        let decision = GreedyPolicy::new().schedule(&ctx).await.unwrap();
        assert_eq!(decision.bindings, vec![(make_uid(1, 0), 0)]);
    }

    #[tokio::test]
    async fn blocks_out_running_exc_that_no_longer_fits() {
        let mut tree = ResourceTree::new();
        tree.register(ResourcePath::parse("sys0.mem0").unwrap(), 100).unwrap();
        let accounter = ResourceAccounter::new(tree);
        let view = accounter.get_view("t").await.unwrap();
        let mut exc = Exc::new(make_uid(1, 0), "e", 5, recipe());
        exc.transition(ExcState::Ready).unwrap();
        exc.begin_sync(0, crate::app::SyncState::Starting).unwrap();
        exc.transition(ExcState::Running).unwrap();
        let ctx = ScheduleContext::new(vec![exc], &accounter, view);

        let decision = GreedyPolicy::new().schedule(&ctx).await.unwrap();
        assert!(decision.bindings.is_empty());
        assert_eq!(decision.blocked_out, vec![make_uid(1, 0)]);
    }

    #[tokio::test]
    async fn two_competing_excs_share_capacity_greedily() {
        let mut tree = ResourceTree::new();
        tree.register(ResourcePath::parse("sys0.mem0").unwrap(), 1000).unwrap();
        let accounter = ResourceAccounter::new(tree);
        let view = accounter.get_view("t").await.unwrap();
        let mut e1 = Exc::new(make_uid(1, 0), "e1", 9, recipe());
        e1.transition(ExcState::Ready).unwrap();
        let mut e2 = Exc::new(make_uid(2, 0), "e2", 5, recipe());
        e2.transition(ExcState::Ready).unwrap();
        // `all()`-style ordering: higher priority first.
        let ctx = ScheduleContext::new(vec![e1, e2], &accounter, view);

        let decision = GreedyPolicy::new().schedule(&ctx).await.unwrap();
        // e1 (priority 9) claims the high-value awm (900), leaving only 100
        // for e2, which doesn't even fit the low-value awm (200) either.
        assert_eq!(decision.bindings, vec![(make_uid(1, 0), 1)]);
    }
}
