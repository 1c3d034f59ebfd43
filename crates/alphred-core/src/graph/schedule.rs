// crates/alphred-core/src/graph/schedule.rs
// ============================================================================
// Module: Alphred Schedule Analysis
// Description: Next-runnable selection and unreachable-pending analysis.
// Purpose: Decide which node runs next and which pendings can never run.
// Dependencies: crate::core, crate::graph, crate::interfaces
// ============================================================================

//! ## Overview
//! A pending node becomes runnable when it has no incoming edges or when a
//! selected incoming edge originates from a completed source. A completed
//! node becomes a revisit when a selected incoming edge carries a newer
//! upstream artifact than the node's own latest artifact (loop re-entry).
//! Unreachable analysis runs to a fixed point: skipping one node can make its
//! downstream pendings unreachable too.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use crate::core::EdgeId;
use crate::core::NodeStatus;
use crate::core::RunNode;
use crate::core::RunNodeId;
use crate::core::TreeEdge;
use crate::core::TreeNodeId;
use crate::graph::routing::RoutingProjection;
use crate::interfaces::LatestArtifact;

// ============================================================================
// SECTION: Next Runnable
// ============================================================================

/// How the next runnable node will be claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    /// Claim a pending node (`pending -> running`).
    Pending,
    /// Revisit a completed node (`completed -> pending -> running`,
    /// attempt + 1).
    Revisit,
}

/// The node selected to run next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextRunnable {
    /// Run node to claim.
    pub run_node_id: RunNodeId,
    /// Claim path for the node's current status.
    pub claim: ClaimKind,
}

/// Finds the first runnable node in canonical order, if any.
#[must_use]
pub fn find_next_runnable(
    nodes: &[RunNode],
    edges: &[TreeEdge],
    projection: &RoutingProjection,
    latest_artifacts: &BTreeMap<RunNodeId, LatestArtifact>,
) -> Option<NextRunnable> {
    let by_tree_node: BTreeMap<TreeNodeId, &RunNode> =
        nodes.iter().map(|node| (node.tree_node_id, node)).collect();
    let edges_by_id: BTreeMap<EdgeId, &TreeEdge> =
        edges.iter().map(|edge| (edge.id, edge)).collect();

    for node in nodes {
        match node.status {
            NodeStatus::Pending => {
                let incoming = projection.incoming_edges_by_target.get(&node.tree_node_id);
                let runnable = match incoming {
                    None => true,
                    Some(edge_ids) => edge_ids.iter().any(|edge_id| {
                        selected_from_completed_source(
                            *edge_id,
                            &edges_by_id,
                            &by_tree_node,
                            projection,
                        )
                    }),
                };
                if runnable {
                    return Some(NextRunnable {
                        run_node_id: node.id,
                        claim: ClaimKind::Pending,
                    });
                }
            }
            NodeStatus::Completed => {
                let own_artifact =
                    latest_artifacts.get(&node.id).map(|artifact| artifact.artifact_id);
                let incoming = projection.incoming_edges_by_target.get(&node.tree_node_id);
                let revisit = incoming.is_some_and(|edge_ids| {
                    edge_ids.iter().any(|edge_id| {
                        let Some(edge) = edges_by_id.get(edge_id) else {
                            return false;
                        };
                        if !selected_from_completed_source(
                            *edge_id,
                            &edges_by_id,
                            &by_tree_node,
                            projection,
                        ) {
                            return false;
                        }
                        let Some(source) = by_tree_node.get(&edge.source_node_id) else {
                            return false;
                        };
                        let source_artifact =
                            latest_artifacts.get(&source.id).map(|artifact| artifact.artifact_id);
                        match (source_artifact, own_artifact) {
                            (Some(upstream), Some(own)) => upstream > own,
                            (Some(_), None) => true,
                            (None, _) => false,
                        }
                    })
                });
                if revisit {
                    return Some(NextRunnable {
                        run_node_id: node.id,
                        claim: ClaimKind::Revisit,
                    });
                }
            }
            NodeStatus::Running
            | NodeStatus::Failed
            | NodeStatus::Skipped
            | NodeStatus::Cancelled => {}
        }
    }
    None
}

/// Returns true when the edge is the selected route of a completed source.
fn selected_from_completed_source(
    edge_id: EdgeId,
    edges_by_id: &BTreeMap<EdgeId, &TreeEdge>,
    by_tree_node: &BTreeMap<TreeNodeId, &RunNode>,
    projection: &RoutingProjection,
) -> bool {
    let Some(edge) = edges_by_id.get(&edge_id) else {
        return false;
    };
    let Some(source) = by_tree_node.get(&edge.source_node_id) else {
        return false;
    };
    source.status == NodeStatus::Completed
        && projection.selected_edge_by_source.get(&edge.source_node_id) == Some(&edge_id)
}

// ============================================================================
// SECTION: Unreachable Analysis
// ============================================================================

/// Computes the pending nodes that can never run, to a fixed point.
///
/// An incoming edge is dead when its source completed and selected a
/// different edge, or when its source is skipped, cancelled, or failed. A
/// source that is pending, running, or completed-but-unresolved keeps the
/// edge alive. Skipping one node is folded back in so downstream pendings
/// collapse in the same pass.
#[must_use]
pub fn compute_unreachable_pending(
    nodes: &[RunNode],
    edges: &[TreeEdge],
    projection: &RoutingProjection,
) -> Vec<RunNodeId> {
    let edges_by_id: BTreeMap<EdgeId, &TreeEdge> =
        edges.iter().map(|edge| (edge.id, edge)).collect();
    let mut statuses: BTreeMap<TreeNodeId, NodeStatus> =
        nodes.iter().map(|node| (node.tree_node_id, node.status)).collect();
    let mut skipped = Vec::new();

    loop {
        let mut changed = false;
        for node in nodes {
            if statuses.get(&node.tree_node_id) != Some(&NodeStatus::Pending) {
                continue;
            }
            let Some(incoming) = projection.incoming_edges_by_target.get(&node.tree_node_id)
            else {
                continue;
            };
            if incoming.is_empty() {
                continue;
            }
            let all_dead = incoming.iter().all(|edge_id| {
                edge_is_dead(*edge_id, &edges_by_id, &statuses, projection)
            });
            if all_dead {
                statuses.insert(node.tree_node_id, NodeStatus::Skipped);
                skipped.push(node.id);
                changed = true;
            }
        }
        if !changed {
            return skipped;
        }
    }
}

/// Returns true when an incoming edge can no longer fire.
fn edge_is_dead(
    edge_id: EdgeId,
    edges_by_id: &BTreeMap<EdgeId, &TreeEdge>,
    statuses: &BTreeMap<TreeNodeId, NodeStatus>,
    projection: &RoutingProjection,
) -> bool {
    let Some(edge) = edges_by_id.get(&edge_id) else {
        return true;
    };
    match statuses.get(&edge.source_node_id) {
        Some(NodeStatus::Completed) => {
            if projection.unresolved_sources.contains(&edge.source_node_id)
                || projection.no_route_sources.contains(&edge.source_node_id)
            {
                // The run is about to fail (or a decision is still awaited);
                // pruning the target would mask that as completion.
                return false;
            }
            projection.selected_edge_by_source.get(&edge.source_node_id) != Some(&edge_id)
        }
        Some(NodeStatus::Skipped | NodeStatus::Cancelled | NodeStatus::Failed) => true,
        Some(NodeStatus::Pending | NodeStatus::Running) | None => false,
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
