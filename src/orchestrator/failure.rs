//! Why a start/stop/complete request did not go through.

use thiserror::Error;

use crate::execution::script::ScriptError;
use crate::execution::{ExecutionStatus, NodeOutcome, OutcomeKind};
use crate::nodes::SelectionError;

#[derive(Debug, Error)]
pub enum SchedulingFailure {
    #[error("execution {0} not found")]
    NotFound(i64),
    #[error("not permitted to operate execution {0}")]
    Forbidden(i64),
    #[error("execution {0} is already running")]
    AlreadyRunning(i64),
    #[error("relayed request for execution {0} names no target nodes")]
    MissingTargets(i64),
    /// Another dispatch of the same execution holds the restart lock.
    #[error("execution {0} is already being dispatched")]
    InFlight(i64),
    #[error("concurrent execution quota of {limit} reached")]
    QuotaExceeded { limit: u32 },
    #[error("script cannot be prepared: {0}")]
    InvalidScript(#[from] ScriptError),
    #[error("no nodes meet conditions: {0}")]
    NoNodes(String),
    #[error("selected node {0} is not live")]
    NodeNotLive(i64),
    #[error("{0}")]
    BusinessRule(String),
    #[error("startup timeout: dispatch lock of execution {0} is no longer held")]
    StartupTimeout(i64),
    #[error("dispatch failed on every node")]
    DispatchFailed(Vec<NodeOutcome>),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl SchedulingFailure {
    /// Transient failures send the execution back to PENDING for a retry;
    /// the rest mark it FAILED.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SchedulingFailure::NoNodes(_) | SchedulingFailure::NodeNotLive(_)
        )
    }

    /// Status a recorded failure leaves the execution in.
    pub fn resulting_status(&self) -> ExecutionStatus {
        if self.is_transient() {
            ExecutionStatus::Pending
        } else {
            ExecutionStatus::Failed
        }
    }

    /// Per-node result list describing this failure.
    pub fn into_outcomes(self) -> Vec<NodeOutcome> {
        match self {
            SchedulingFailure::DispatchFailed(outcomes) => outcomes,
            other => vec![NodeOutcome::failed(
                None,
                OutcomeKind::Scheduling,
                other.to_string(),
            )],
        }
    }

    /// Same as [`into_outcomes`](Self::into_outcomes) but one entry per
    /// requested node, so a relaying primary can attribute it.
    pub fn into_node_outcomes(self, node_ids: &[i64]) -> Vec<NodeOutcome> {
        match self {
            SchedulingFailure::DispatchFailed(outcomes) => outcomes,
            other => {
                let message = other.to_string();
                node_ids
                    .iter()
                    .map(|id| NodeOutcome::failed(Some(*id), OutcomeKind::Scheduling, message.clone()))
                    .collect()
            }
        }
    }
}

impl From<SelectionError> for SchedulingFailure {
    fn from(e: SelectionError) -> Self {
        match e {
            SelectionError::NoNodes(reason) => SchedulingFailure::NoNodes(reason),
            SelectionError::NodeNotLive(id) => SchedulingFailure::NodeNotLive(id),
            SelectionError::Storage(e) => SchedulingFailure::Storage(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_split() {
        assert!(SchedulingFailure::NoNodes("none".into()).is_transient());
        assert!(SchedulingFailure::NodeNotLive(3).is_transient());
        assert!(!SchedulingFailure::BusinessRule("trial cap".into()).is_transient());
        assert!(!SchedulingFailure::InvalidScript(ScriptError::Empty).is_transient());
        assert_eq!(
            SchedulingFailure::QuotaExceeded { limit: 2 }.resulting_status(),
            ExecutionStatus::Failed
        );
    }

    #[test]
    fn test_selection_errors_keep_their_message() {
        let failure: SchedulingFailure = SelectionError::NoNodes("no enabled nodes for tenant 7".into()).into();
        assert_eq!(
            failure.to_string(),
            "no nodes meet conditions: no enabled nodes for tenant 7"
        );
    }

    #[test]
    fn test_outcomes() {
        let outcomes = SchedulingFailure::InFlight(5).into_outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].kind, OutcomeKind::Scheduling);

        let per_node = SchedulingFailure::StartupTimeout(5).into_node_outcomes(&[1, 2]);
        assert_eq!(per_node.len(), 2);
        assert_eq!(per_node[1].node_id, Some(2));
    }
}
