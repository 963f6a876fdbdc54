//! Strategy evaluation and the completion decision
//!
//! Evaluation runs against a snapshot. An append-driven `Complete` verdict is
//! only acted on through `try_complete(snapshot.version)`, so the member set
//! that satisfied the strategy is exactly the member set that gets
//! dispatched. A timer-driven verdict seals the group as it stands.

use super::conditions::ConditionRegistry;
use super::dispatcher::Dispatcher;
use super::error::ReducerError;
use super::store::GroupStore;
use super::strategy::{Evaluation, Strategy, StrategyDescriptor, Trigger};
use super::types::{AggregationGroup, GroupState};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// This caller won the CAS and delivered; carries the dispatch id
    Dispatched(String),
    /// Another caller completed the group first, or the snapshot went stale
    LostRace,
    NotComplete,
    /// Predicate error or timeout; the group stays pending
    EvaluationFailed(String),
    /// Group expired or never existed
    Gone,
    AlreadyCompleted,
}

pub struct StrategyEvaluator {
    store: Arc<dyn GroupStore>,
    dispatcher: Arc<Dispatcher>,
    conditions: ConditionRegistry,
}

impl StrategyEvaluator {
    pub fn new(
        store: Arc<dyn GroupStore>,
        dispatcher: Arc<Dispatcher>,
        conditions: ConditionRegistry,
    ) -> Self {
        Self {
            store,
            dispatcher,
            conditions,
        }
    }

    pub fn resolve(&self, descriptor: &StrategyDescriptor) -> Result<Strategy, ReducerError> {
        Strategy::from_descriptor(descriptor, &self.conditions)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Evaluate one snapshot and, if complete, race for the transition
    pub async fn evaluate(
        &self,
        group: &AggregationGroup,
        trigger: Trigger,
    ) -> Result<EvaluationOutcome, ReducerError> {
        if !group.is_pending() {
            return Ok(EvaluationOutcome::AlreadyCompleted);
        }

        let strategy = self.resolve(&group.strategy)?;

        match strategy.evaluate(group, trigger).await {
            Evaluation::NotComplete => Ok(EvaluationOutcome::NotComplete),
            Evaluation::Error(reason) => {
                log::warn!(
                    "⚠️  Evaluation of group {} failed, leaving it pending: {}",
                    group.group_id,
                    reason
                );
                Ok(EvaluationOutcome::EvaluationFailed(reason))
            }
            Evaluation::Complete { reason } => {
                let Some(completed) = self.complete(group, trigger).await? else {
                    log::debug!("Lost completion race for group {}", group.group_id);
                    return Ok(EvaluationOutcome::LostRace);
                };

                log::info!("🔒 Group {} completed: {}", group.group_id, reason);

                let dispatch_id = self.dispatcher.dispatch(&completed, &reason).await?;
                Ok(EvaluationOutcome::Dispatched(dispatch_id))
            }
        }
    }

    /// Perform the PENDING -> COMPLETED transition and return the member set
    /// to dispatch, or `None` when another caller got there first.
    ///
    /// Append-driven completions are version-guarded: the snapshot that
    /// satisfied the strategy is the one dispatched. Timer-driven completions
    /// are unconditional once the timer fires, so they seal whatever is
    /// present and can not be starved by concurrent appends.
    async fn complete(
        &self,
        group: &AggregationGroup,
        trigger: Trigger,
    ) -> Result<Option<AggregationGroup>, ReducerError> {
        match trigger {
            Trigger::Timer => self.store.seal(&group.group_id).await,
            Trigger::Append => {
                if !self.store.try_complete(&group.group_id, group.version).await? {
                    return Ok(None);
                }
                let mut frozen = group.clone();
                frozen.state = GroupState::Completed;
                frozen.completed_at = Some(self.dispatcher.now());
                Ok(Some(frozen))
            }
        }
    }

    /// Timer callback: re-read the group and evaluate with `Trigger::Timer`.
    /// Tolerates the group being gone or already completed.
    pub async fn on_timer(&self, group_id: &str) -> Result<EvaluationOutcome, ReducerError> {
        let Some(group) = self.store.get(group_id).await? else {
            log::debug!("Timer fired for expired group {}", group_id);
            return Ok(EvaluationOutcome::Gone);
        };

        self.evaluate(&group, Trigger::Timer).await
    }
}
