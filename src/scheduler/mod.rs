//! Scheduler Driver (C6): drives one scheduling round — get a fresh working
//! view, ask the policy for a decision, stage the decision's resource
//! bindings on that view, then hand the round to the Synchronization
//! Manager for approval.

pub mod policy;
pub mod policies;

use std::sync::Arc;

use tracing::{info, warn};

use crate::app::registry::ApplicationRegistry;
use crate::app::ExcState;
use crate::error::Result;
use crate::res::accounter::ResourceAccounter;
use crate::sync::{classify_change, value_direction, RoundOutcome, ScheduledTransition, SyncManager};
use policy::{Policy, ScheduleContext};

pub struct SchedulerDriver {
    accounter: Arc<ResourceAccounter>,
    registry: Arc<ApplicationRegistry>,
    sync: Arc<SyncManager>,
    policy: Arc<dyn Policy>,
}

impl SchedulerDriver {
    pub fn new(
        accounter: Arc<ResourceAccounter>,
        registry: Arc<ApplicationRegistry>,
        sync: Arc<SyncManager>,
        policy: Arc<dyn Policy>,
    ) -> Self {
        Self { accounter, registry, sync, policy }
    }

    /// Run one scheduling round to completion against `(system, view)`.
    /// Returns the round's outcome; an empty decision (nothing to do)
    /// yields an empty, non-failing outcome.
    pub async fn run_once(&self) -> Result<RoundOutcome> {
        let view = self.accounter.get_view(self.policy.name()).await?;
        let exc = self.registry.all().await;
        let ctx = ScheduleContext::new(exc, &self.accounter, view);

        let decision = match self.policy.schedule(&ctx).await {
            Ok(d) => d,
            Err(e) => {
                self.accounter.delete_view(view).await;
                warn!(policy = self.policy.name(), err = %e, "scheduling policy failed, round aborted");
                return Err(e);
            }
        };

        if decision.is_empty() {
            self.accounter.delete_view(view).await;
            return Ok(RoundOutcome::default());
        }

        let mut transitions = Vec::new();
        for (uid, awm_id) in &decision.bindings {
            let exc = self.registry.get(*uid).await?;
            let next_awm = exc
                .recipe
                .awm(*awm_id)
                .cloned()
                .ok_or_else(|| crate::error::RtrmError::NotFound(format!("awm {awm_id}")))?;
            let current_awm = exc.current_awm.and_then(|id| exc.recipe.awm(id).cloned());
            let old_bound = exc.current_awm.map(|id| exc.recipe.bind(id)).transpose()?;
            let new_bound = exc.recipe.bind(*awm_id)?;

            let old_requests = old_bound.map(|b| b.requests).unwrap_or_default();
            if let Err(e) = self
                .accounter
                .rebind(*uid, &old_requests, &new_bound.requests, view)
                .await
            {
                warn!(uid, awm = awm_id, err = %e, "policy binding did not fit, skipping this exc this round");
                continue;
            }

            let resource_class = classify_change(current_awm.as_ref(), &next_awm);
            let direction = value_direction(&exc.recipe, exc.current_awm, *awm_id);
            transitions.push(ScheduledTransition {
                uid: *uid,
                from_awm: exc.current_awm,
                to_awm: *awm_id,
                resource_class,
                value_direction: direction,
                is_starter: exc.state == ExcState::Ready,
            });
        }

        let mut token_seed = 0u64;
        let outcome = self
            .sync
            .run_round(&self.registry, &self.accounter, view, &decision.blocked_out, &transitions, &mut token_seed)
            .await;

        self.accounter.commit(view).await?;
        info!(
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "scheduling round committed"
        );
        Ok(outcome)
    }
}
