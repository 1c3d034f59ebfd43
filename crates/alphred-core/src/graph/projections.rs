// crates/alphred-core/src/graph/projections.rs
// ============================================================================
// Module: Alphred Graph Projections
// Description: Latest-attempt and latest-artifact projections over run rows.
// Purpose: Collapse raw rows into the deterministic views the scheduler scans.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! The scheduler never looks at raw row order. Run nodes collapse to one row
//! per tree node (highest attempt, then highest id) and scan in the canonical
//! `(sequence_index, node_key, id)` order; node keys compare by code units so
//! the ordering is identical across implementations.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use crate::core::RoutingDecision;
use crate::core::RunNode;
use crate::core::RunNodeId;
use crate::core::TreeNodeId;
use crate::interfaces::LatestArtifact;

// ============================================================================
// SECTION: Latest-Attempt Projection
// ============================================================================

/// Collapses run-node rows to one per tree node, keeping the row with the
/// highest `(attempt, id)`, ordered by `(sequence_index, node_key, id)`.
#[must_use]
pub fn latest_run_node_attempts(rows: &[RunNode]) -> Vec<RunNode> {
    let mut latest: BTreeMap<TreeNodeId, RunNode> = BTreeMap::new();
    for row in rows {
        match latest.get(&row.tree_node_id) {
            Some(current) if (current.attempt, current.id) >= (row.attempt, row.id) => {}
            _ => {
                latest.insert(row.tree_node_id, row.clone());
            }
        }
    }
    let mut nodes: Vec<RunNode> = latest.into_values().collect();
    nodes.sort_by(|left, right| {
        left.sequence_index
            .cmp(&right.sequence_index)
            .then_with(|| left.node_key.as_bytes().cmp(right.node_key.as_bytes()))
            .then_with(|| left.id.cmp(&right.id))
    });
    nodes
}

// ============================================================================
// SECTION: Lookup Maps
// ============================================================================

/// Indexes latest artifacts by their producing run node.
#[must_use]
pub fn latest_artifacts_map(latest: &[LatestArtifact]) -> BTreeMap<RunNodeId, LatestArtifact> {
    latest.iter().map(|entry| (entry.run_node_id, *entry)).collect()
}

/// Indexes latest routing decisions by their deciding run node.
#[must_use]
pub fn latest_decisions_map(
    decisions: &[RoutingDecision],
) -> BTreeMap<RunNodeId, RoutingDecision> {
    decisions.iter().map(|decision| (decision.run_node_id, decision.clone())).collect()
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::unwrap_used,
        reason = "Test-only panic-based assertions are permitted."
    )]

    use super::latest_run_node_attempts;
    use crate::core::NodeStatus;
    use crate::core::RunId;
    use crate::core::RunNode;
    use crate::core::RunNodeId;
    use crate::core::Timestamp;
    use crate::core::TreeNodeId;

    /// Builds a run-node row for projection tests.
    fn row(id: i64, tree_node: i64, key: &str, attempt: i64, sequence: i64) -> RunNode {
        RunNode {
            id: RunNodeId::from_raw(id).unwrap(),
            run_id: RunId::from_raw(1).unwrap(),
            tree_node_id: TreeNodeId::from_raw(tree_node).unwrap(),
            node_key: key.to_string(),
            status: NodeStatus::Pending,
            attempt,
            sequence_index: sequence,
            started_at: None,
            completed_at: None,
            updated_at: Timestamp::from_unix_millis(0),
        }
    }

    /// Keeps the highest `(attempt, id)` row per tree node.
    #[test]
    fn collapses_to_highest_attempt() {
        let rows = vec![
            row(1, 10, "design", 1, 0),
            row(4, 10, "design", 3, 0),
            row(2, 10, "design", 2, 0),
            row(3, 20, "implement", 1, 1),
        ];
        let latest = latest_run_node_attempts(&rows);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].attempt, 3);
        assert_eq!(latest[0].id.get(), 4);
        assert_eq!(latest[1].node_key, "implement");
    }

    /// Equal attempts break ties on the higher id.
    #[test]
    fn equal_attempts_prefer_higher_id() {
        let rows = vec![row(5, 10, "design", 2, 0), row(9, 10, "design", 2, 0)];
        let latest = latest_run_node_attempts(&rows);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id.get(), 9);
    }

    /// Output order is sequence index, then code-unit node key, then id.
    #[test]
    fn deterministic_ordering() {
        let rows = vec![
            row(1, 10, "zeta", 1, 1),
            row(2, 20, "alpha", 1, 1),
            row(3, 30, "Beta", 1, 1),
            row(4, 40, "first", 1, 0),
        ];
        let latest = latest_run_node_attempts(&rows);
        let keys: Vec<_> = latest.iter().map(|node| node.node_key.as_str()).collect();
        // Uppercase sorts before lowercase in code-unit order.
        assert_eq!(keys, vec!["first", "Beta", "alpha", "zeta"]);
    }
}
