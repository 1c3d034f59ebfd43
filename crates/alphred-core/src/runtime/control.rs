// crates/alphred-core/src/runtime/control.rs
// ============================================================================
// Module: Alphred Run Controls
// Description: Cancel, pause, resume, and retry operations on runs.
// Purpose: Apply operator controls idempotently under optimistic concurrency.
// Dependencies: crate::{core, interfaces}, serde, thiserror
// ============================================================================

//! ## Overview
//! Each control re-reads the run, decides applied/noop/invalid from the
//! observed status, and applies guarded transitions. Precondition misses are
//! retried a bounded number of times before surfacing a concurrent-conflict
//! error; controls never spin unbounded against a contended run.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::core::RunId;
use crate::core::RunNodeId;
use crate::core::RunStatus;
use crate::interfaces::StoreError;
use crate::interfaces::WorkflowStore;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Bounded precondition-retry budget for control operations.
pub const MAX_CONTROL_PRECONDITION_RETRIES: u32 = 5;

// ============================================================================
// SECTION: Actions and Results
// ============================================================================

/// Operator control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunControlAction {
    /// Cancel the run from pending, running, or paused.
    Cancel,
    /// Pause a running run.
    Pause,
    /// Resume a paused run.
    Resume,
    /// Requeue a failed run's failed nodes and set it running.
    Retry,
}

impl RunControlAction {
    /// Returns the stable action label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Retry => "retry",
        }
    }
}

impl fmt::Display for RunControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a control changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOutcome {
    /// The control transitioned the run.
    Applied,
    /// The run was already in the control's target state.
    Noop,
}

/// Result of one control operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunControlResult {
    /// The action performed.
    pub action: RunControlAction,
    /// Applied or noop.
    pub outcome: ControlOutcome,
    /// Controlled run.
    pub workflow_run_id: RunId,
    /// Status observed before the control.
    pub previous_run_status: RunStatus,
    /// Status after the control.
    pub run_status: RunStatus,
    /// Nodes requeued by a retry (empty for other actions).
    pub retried_run_node_ids: Vec<RunNodeId>,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Control operation errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The control is not allowed from the run's current status.
    #[error("run control invalid transition: cannot {action} a {status} run")]
    InvalidTransition {
        /// Attempted action.
        action: RunControlAction,
        /// Status the run was observed in.
        status: RunStatus,
    },
    /// A retry found no latest-attempt failed nodes to requeue.
    #[error("run control retry targets not found for run {0}")]
    RetryTargetsNotFound(RunId),
    /// Precondition retries were exhausted by concurrent writers.
    #[error("run control concurrent conflict: {action} on run {run_id}")]
    ConcurrentConflict {
        /// Attempted action.
        action: RunControlAction,
        /// Contended run.
        run_id: RunId,
    },
    /// Run does not exist.
    #[error("workflow run not found: {0}")]
    RunNotFound(RunId),
    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// SECTION: Control Execution
// ============================================================================

/// What one control iteration decided.
enum Decision {
    /// Transition the run to this status.
    Apply(RunStatus),
    /// Run the transactional retry requeue.
    ApplyRetry,
    /// The run is already where this control leads.
    Noop,
}

/// Applies a control action to a run with bounded precondition retries.
///
/// # Errors
///
/// Returns [`ControlError::InvalidTransition`] for disallowed source states,
/// [`ControlError::RetryTargetsNotFound`] when a retry has nothing to
/// requeue, and [`ControlError::ConcurrentConflict`] when concurrent writers
/// exhaust the retry budget.
pub fn control_run<S: WorkflowStore>(
    store: &S,
    run_id: RunId,
    action: RunControlAction,
) -> Result<RunControlResult, ControlError> {
    for _ in 0 .. MAX_CONTROL_PRECONDITION_RETRIES {
        let run = store.load_run(run_id)?.ok_or(ControlError::RunNotFound(run_id))?;
        let previous = run.status;
        let decision = decide(action, previous)?;

        match decision {
            Decision::Noop => {
                return Ok(RunControlResult {
                    action,
                    outcome: ControlOutcome::Noop,
                    workflow_run_id: run_id,
                    previous_run_status: previous,
                    run_status: previous,
                    retried_run_node_ids: Vec::new(),
                });
            }
            Decision::Apply(target) => {
                match store.transition_run(run_id, previous, target) {
                    Ok(()) => {
                        return Ok(RunControlResult {
                            action,
                            outcome: ControlOutcome::Applied,
                            workflow_run_id: run_id,
                            previous_run_status: previous,
                            run_status: target,
                            retried_run_node_ids: Vec::new(),
                        });
                    }
                    Err(error) if error.is_precondition() => {}
                    Err(error) => return Err(error.into()),
                }
            }
            Decision::ApplyRetry => match store.requeue_failed_nodes(run_id) {
                Ok(requeued) => {
                    if requeued.is_empty() {
                        return Err(ControlError::RetryTargetsNotFound(run_id));
                    }
                    return Ok(RunControlResult {
                        action,
                        outcome: ControlOutcome::Applied,
                        workflow_run_id: run_id,
                        previous_run_status: previous,
                        run_status: RunStatus::Running,
                        retried_run_node_ids: requeued,
                    });
                }
                Err(error) if error.is_precondition() => {}
                Err(error) => return Err(error.into()),
            },
        }
    }
    Err(ControlError::ConcurrentConflict {
        action,
        run_id,
    })
}

/// Maps an observed status to the control's decision.
fn decide(action: RunControlAction, status: RunStatus) -> Result<Decision, ControlError> {
    let decision = match action {
        RunControlAction::Cancel => match status {
            RunStatus::Cancelled => Decision::Noop,
            RunStatus::Pending | RunStatus::Running | RunStatus::Paused => {
                Decision::Apply(RunStatus::Cancelled)
            }
            RunStatus::Completed | RunStatus::Failed => {
                return Err(ControlError::InvalidTransition {
                    action,
                    status,
                });
            }
        },
        RunControlAction::Pause => match status {
            RunStatus::Paused => Decision::Noop,
            RunStatus::Running => Decision::Apply(RunStatus::Paused),
            RunStatus::Pending
            | RunStatus::Completed
            | RunStatus::Failed
            | RunStatus::Cancelled => {
                return Err(ControlError::InvalidTransition {
                    action,
                    status,
                });
            }
        },
        RunControlAction::Resume => match status {
            RunStatus::Running => Decision::Noop,
            RunStatus::Paused => Decision::Apply(RunStatus::Running),
            RunStatus::Pending
            | RunStatus::Completed
            | RunStatus::Failed
            | RunStatus::Cancelled => {
                return Err(ControlError::InvalidTransition {
                    action,
                    status,
                });
            }
        },
        RunControlAction::Retry => match status {
            RunStatus::Running => Decision::Noop,
            RunStatus::Failed => Decision::ApplyRetry,
            RunStatus::Pending
            | RunStatus::Paused
            | RunStatus::Completed
            | RunStatus::Cancelled => {
                return Err(ControlError::InvalidTransition {
                    action,
                    status,
                });
            }
        },
    };
    Ok(decision)
}
