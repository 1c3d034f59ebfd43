// crates/alphred-core/src/core/status.rs
// ============================================================================
// Module: Alphred Lifecycle Status
// Description: Run and run-node lifecycle enums plus transition tables.
// Purpose: Enforce the state machines that every status mutation must respect.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Workflow runs and run nodes evolve through fixed state machines. This
//! module owns the status enums, their stable TEXT codecs, and the allowed
//! transition tables. Callers combine these checks with row-level guarded
//! updates so concurrent writers cannot skip states.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Run Status
// ============================================================================

/// Workflow run lifecycle status.
///
/// # Invariants
/// - Variants are stable for serialization and database storage.
/// - `Completed`, `Failed`, and `Cancelled` are sinks with no outbound edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run has been materialized but not started.
    Pending,
    /// Run is actively being advanced.
    Running,
    /// Run is paused by an operator; execution must not advance.
    Paused,
    /// Run finished with every node settled successfully.
    Completed,
    /// Run finished with at least one node failed or unroutable.
    Failed,
    /// Run was cancelled by an operator.
    Cancelled,
}

impl RunStatus {
    /// Returns true when the status is a terminal sink.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true when the run state machine allows `self -> target`.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::Cancelled),
            Self::Running => matches!(
                target,
                Self::Paused | Self::Completed | Self::Failed | Self::Cancelled
            ),
            Self::Paused => matches!(target, Self::Running | Self::Cancelled),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Returns the stable TEXT form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses the stable TEXT form (returns `None` for unknown values).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION: Node Status
// ============================================================================

/// Run-node lifecycle status.
///
/// # Invariants
/// - Variants are stable for serialization and database storage.
/// - Revisit and retry transitions must increment the attempt counter in the
///   same guarded update that changes the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Node is waiting to be claimed.
    Pending,
    /// Node is claimed and executing.
    Running,
    /// Node finished its latest attempt successfully.
    Completed,
    /// Node exhausted its latest attempt with an error.
    Failed,
    /// Node was pruned as unreachable.
    Skipped,
    /// Node was cancelled together with its run.
    Cancelled,
}

impl NodeStatus {
    /// Returns true when the node state machine allows `self -> target`.
    ///
    /// The table mirrors the scheduler's claim, retry, revisit, and pruning
    /// paths; any other pair is a precondition violation.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::Skipped),
            Self::Running => matches!(target, Self::Completed | Self::Failed | Self::Running),
            Self::Completed => matches!(target, Self::Pending),
            Self::Failed => matches!(target, Self::Running | Self::Pending),
            Self::Skipped => matches!(target, Self::Pending),
            Self::Cancelled => false,
        }
    }

    /// Returns the stable TEXT form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses the stable TEXT form (returns `None` for unknown values).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::NodeStatus;
    use super::RunStatus;

    /// Terminal run statuses admit no outbound transitions.
    #[test]
    fn run_terminal_statuses_are_sinks() {
        for terminal in [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for target in [
                RunStatus::Pending,
                RunStatus::Running,
                RunStatus::Paused,
                RunStatus::Completed,
                RunStatus::Failed,
                RunStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    /// Paused runs may only resume or cancel.
    #[test]
    fn paused_run_transitions() {
        assert!(RunStatus::Paused.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Paused.can_transition_to(RunStatus::Cancelled));
        assert!(!RunStatus::Paused.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Paused.can_transition_to(RunStatus::Failed));
    }

    /// The node table admits exactly the scheduler's paths.
    #[test]
    fn node_transition_table() {
        assert!(NodeStatus::Pending.can_transition_to(NodeStatus::Running));
        assert!(NodeStatus::Pending.can_transition_to(NodeStatus::Skipped));
        assert!(NodeStatus::Running.can_transition_to(NodeStatus::Completed));
        assert!(NodeStatus::Running.can_transition_to(NodeStatus::Failed));
        assert!(NodeStatus::Running.can_transition_to(NodeStatus::Running));
        assert!(NodeStatus::Completed.can_transition_to(NodeStatus::Pending));
        assert!(NodeStatus::Failed.can_transition_to(NodeStatus::Running));
        assert!(NodeStatus::Failed.can_transition_to(NodeStatus::Pending));
        assert!(NodeStatus::Skipped.can_transition_to(NodeStatus::Pending));
        assert!(!NodeStatus::Pending.can_transition_to(NodeStatus::Completed));
        assert!(!NodeStatus::Completed.can_transition_to(NodeStatus::Running));
        assert!(!NodeStatus::Cancelled.can_transition_to(NodeStatus::Pending));
    }

    /// TEXT codecs round-trip every variant.
    #[test]
    fn status_text_round_trip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Paused,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            NodeStatus::Pending,
            NodeStatus::Running,
            NodeStatus::Completed,
            NodeStatus::Failed,
            NodeStatus::Skipped,
            NodeStatus::Cancelled,
        ] {
            assert_eq!(NodeStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("unknown"), None);
        assert_eq!(NodeStatus::parse("unknown"), None);
    }
}
