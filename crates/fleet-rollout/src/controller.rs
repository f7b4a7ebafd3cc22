//! Rollout controller: phase state machine of one instance group.
//!
//! The controller decides *what* happens next; the coordinator does it and
//! reports back how the step went:
//!
//! ```text
//!   Pending ─► ScaleDown ─► ScaleUp ─► Canary ─► Rolling 1..n ─► Converged
//!                  │            │          │            │
//!                  └────────────┴──────────┴────────────┴──► Failed
//! ```
//!
//! Phases with nothing to do are skipped. A failed step stops the group
//! where it is; nothing already converged is undone.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::strategy::{Batch, BatchKind, UpdateConfig, plan_batches};

/// Current phase of a group rollout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutPhase {
    Pending,
    /// Deleting instances the plan no longer wants.
    ScaleDown,
    /// Assigning identity (and DNS rows) to new instances.
    ScaleUp,
    Canary,
    Rolling { current: u32, total: u32 },
    Converged,
    Failed { reason: String },
}

impl RolloutPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RolloutPhase::Converged | RolloutPhase::Failed { .. })
    }

    fn describe(&self) -> String {
        match self {
            RolloutPhase::Pending => "pending".to_string(),
            RolloutPhase::ScaleDown => "scale down".to_string(),
            RolloutPhase::ScaleUp => "scale up".to_string(),
            RolloutPhase::Canary => "canary update".to_string(),
            RolloutPhase::Rolling { current, total } => format!("batch {current}/{total}"),
            RolloutPhase::Converged => "converged".to_string(),
            RolloutPhase::Failed { .. } => "failed".to_string(),
        }
    }
}

/// What changes for a group, as counted by the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupChanges {
    /// Instances to delete.
    pub obsolete: u32,
    /// Instances to create an identity for.
    pub admitted: u32,
    /// Instances that need a (new) VM, after scale up.
    pub to_update: u32,
}

/// Outcome of the last step, reported back to [`GroupRollout::advance`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepHealth {
    pub succeeded: u32,
    pub total: u32,
}

impl StepHealth {
    pub fn of(succeeded: u32, total: u32) -> Self {
        Self { succeeded, total }
    }

    pub fn is_healthy(&self) -> bool {
        self.succeeded >= self.total
    }
}

/// Action the coordinator should perform next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchAction {
    DeleteObsolete { count: u32 },
    AdmitNew { count: u32 },
    /// Update instances in `batch.range()` of the update list.
    UpdateBatch(Batch),
    /// The previous step failed; stop here.
    Halt,
}

/// Rollout of one instance group.
#[derive(Debug)]
pub struct GroupRollout {
    pub deployment: String,
    pub group: String,
    pub phase: RolloutPhase,
    steps: VecDeque<BatchAction>,
    rolling_total: u32,
    rolling_done: u32,
}

impl GroupRollout {
    pub fn new(
        deployment: impl Into<String>,
        group: impl Into<String>,
        changes: GroupChanges,
        config: &UpdateConfig,
    ) -> Self {
        let mut steps = VecDeque::new();
        if changes.obsolete > 0 {
            steps.push_back(BatchAction::DeleteObsolete {
                count: changes.obsolete,
            });
        }
        if changes.admitted > 0 {
            steps.push_back(BatchAction::AdmitNew {
                count: changes.admitted,
            });
        }
        let batches = plan_batches(changes.to_update, config);
        let rolling_total = batches
            .iter()
            .filter(|b| b.kind == BatchKind::Rolling)
            .count() as u32;
        steps.extend(batches.into_iter().map(BatchAction::UpdateBatch));

        Self {
            deployment: deployment.into(),
            group: group.into(),
            phase: RolloutPhase::Pending,
            steps,
            rolling_total,
            rolling_done: 0,
        }
    }

    /// Check how the previous step went and hand out the next one.
    ///
    /// Returns `None` once the group converged or failed.
    pub fn advance(&mut self, last: &StepHealth) -> Option<BatchAction> {
        if self.phase.is_terminal() {
            return None;
        }

        if !last.is_healthy() {
            let reason = format!(
                "{}: {} of {} failed",
                self.phase.describe(),
                last.total - last.succeeded,
                last.total
            );
            warn!(deployment = %self.deployment, group = %self.group, %reason, "group rollout halted");
            self.phase = RolloutPhase::Failed { reason };
            return Some(BatchAction::Halt);
        }

        let Some(action) = self.steps.pop_front() else {
            info!(deployment = %self.deployment, group = %self.group, "group converged");
            self.phase = RolloutPhase::Converged;
            return None;
        };

        self.phase = match &action {
            BatchAction::DeleteObsolete { .. } => RolloutPhase::ScaleDown,
            BatchAction::AdmitNew { .. } => RolloutPhase::ScaleUp,
            BatchAction::UpdateBatch(batch) if batch.kind == BatchKind::Canary => RolloutPhase::Canary,
            BatchAction::UpdateBatch(_) => {
                self.rolling_done += 1;
                RolloutPhase::Rolling {
                    current: self.rolling_done,
                    total: self.rolling_total,
                }
            }
            BatchAction::Halt => RolloutPhase::Failed {
                reason: "halted".to_string(),
            },
        };
        debug!(
            deployment = %self.deployment,
            group = %self.group,
            phase = %self.phase.describe(),
            "group rollout advanced"
        );
        Some(action)
    }

    /// Failure reason, once failed.
    pub fn failure(&self) -> Option<&str> {
        match &self.phase {
            RolloutPhase::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(canaries: u32, max_in_flight: u32) -> UpdateConfig {
        UpdateConfig {
            canaries,
            max_in_flight,
            ..Default::default()
        }
    }

    fn drive(rollout: &mut GroupRollout) -> Vec<BatchAction> {
        let mut actions = Vec::new();
        let mut last = StepHealth::default();
        while let Some(action) = rollout.advance(&last) {
            last = match &action {
                BatchAction::DeleteObsolete { count } | BatchAction::AdmitNew { count } => {
                    StepHealth::of(*count, *count)
                }
                BatchAction::UpdateBatch(batch) => StepHealth::of(batch.count, batch.count),
                BatchAction::Halt => StepHealth::default(),
            };
            actions.push(action);
        }
        actions
    }

    #[test]
    fn scale_up_then_canary_then_batches() {
        let changes = GroupChanges {
            obsolete: 0,
            admitted: 9,
            to_update: 9,
        };
        let mut rollout = GroupRollout::new("d", "web", changes, &config(2, 5));
        let actions = drive(&mut rollout);
        assert_eq!(actions[0], BatchAction::AdmitNew { count: 9 });
        assert_eq!(
            actions[1],
            BatchAction::UpdateBatch(Batch { kind: BatchKind::Canary, start: 0, count: 2 })
        );
        assert_eq!(
            actions[2],
            BatchAction::UpdateBatch(Batch { kind: BatchKind::Rolling, start: 2, count: 5 })
        );
        assert_eq!(
            actions[3],
            BatchAction::UpdateBatch(Batch { kind: BatchKind::Rolling, start: 7, count: 2 })
        );
        assert_eq!(actions.len(), 4);
        assert_eq!(rollout.phase, RolloutPhase::Converged);
    }

    #[test]
    fn scale_down_comes_first() {
        let changes = GroupChanges {
            obsolete: 1,
            admitted: 0,
            to_update: 1,
        };
        let mut rollout = GroupRollout::new("d", "web", changes, &config(1, 1));
        let first = rollout.advance(&StepHealth::default()).unwrap();
        assert_eq!(first, BatchAction::DeleteObsolete { count: 1 });
        assert_eq!(rollout.phase, RolloutPhase::ScaleDown);
    }

    #[test]
    fn rolling_phase_counts_batches() {
        let changes = GroupChanges {
            obsolete: 0,
            admitted: 0,
            to_update: 4,
        };
        let mut rollout = GroupRollout::new("d", "web", changes, &config(0, 2));
        rollout.advance(&StepHealth::default());
        assert_eq!(rollout.phase, RolloutPhase::Rolling { current: 1, total: 2 });
        rollout.advance(&StepHealth::of(2, 2));
        assert_eq!(rollout.phase, RolloutPhase::Rolling { current: 2, total: 2 });
        assert!(rollout.advance(&StepHealth::of(2, 2)).is_none());
        assert_eq!(rollout.phase, RolloutPhase::Converged);
    }

    #[test]
    fn failed_canary_halts_forward_only() {
        let changes = GroupChanges {
            obsolete: 0,
            admitted: 0,
            to_update: 5,
        };
        let mut rollout = GroupRollout::new("d", "web", changes, &config(1, 2));
        rollout.advance(&StepHealth::default());
        assert_eq!(rollout.phase, RolloutPhase::Canary);

        let action = rollout.advance(&StepHealth::of(0, 1)).unwrap();
        assert_eq!(action, BatchAction::Halt);
        assert_eq!(rollout.failure(), Some("canary update: 1 of 1 failed"));
        assert!(rollout.advance(&StepHealth::default()).is_none());
    }

    #[test]
    fn last_batch_is_checked_before_converging() {
        let changes = GroupChanges {
            obsolete: 0,
            admitted: 0,
            to_update: 1,
        };
        let mut rollout = GroupRollout::new("d", "web", changes, &config(1, 1));
        rollout.advance(&StepHealth::default());
        assert_eq!(rollout.advance(&StepHealth::of(0, 1)), Some(BatchAction::Halt));
        assert!(matches!(rollout.phase, RolloutPhase::Failed { .. }));
    }

    #[test]
    fn nothing_to_do_converges_immediately() {
        let mut rollout = GroupRollout::new("d", "web", GroupChanges::default(), &config(1, 1));
        assert!(rollout.advance(&StepHealth::default()).is_none());
        assert_eq!(rollout.phase, RolloutPhase::Converged);
    }
}
