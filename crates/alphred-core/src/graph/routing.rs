// crates/alphred-core/src/graph/routing.rs
// ============================================================================
// Module: Alphred Routing Selection
// Description: Edge selection from routing decisions with staleness checks.
// Purpose: Project completed sources onto selected, unresolved, or no-route.
// Dependencies: crate::core, crate::graph, crate::interfaces
// ============================================================================

//! ## Overview
//! For every completed source the scheduler scans outgoing success edges in
//! `(priority, target_node_id, id)` order. Auto edges match unconditionally;
//! guarded edges need a fresh routing decision. A decision is fresh only when
//! its recorded attempt equals the node's current attempt (historical NULL
//! attempts are always stale) and it is not older than the node's latest
//! artifact.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::core::DecisionSignal;
use crate::core::EdgeId;
use crate::core::GuardContext;
use crate::core::GuardError;
use crate::core::GuardExpression;
use crate::core::GuardId;
use crate::core::NodeStatus;
use crate::core::RouteOn;
use crate::core::RoutingDecision;
use crate::core::RunNode;
use crate::core::RunNodeId;
use crate::core::TreeEdge;
use crate::core::TreeNodeId;
use crate::core::evaluate_guard;
use crate::interfaces::LatestArtifact;

// ============================================================================
// SECTION: Inputs
// ============================================================================

/// Snapshot the routing projection is computed over.
#[derive(Debug, Clone)]
pub struct RoutingInputs<'a> {
    /// Latest-attempt run nodes in canonical order.
    pub nodes: &'a [RunNode],
    /// All edges of the run's tree.
    pub edges: &'a [TreeEdge],
    /// Latest routing decision per run node.
    pub decisions: &'a BTreeMap<RunNodeId, RoutingDecision>,
    /// Latest artifact per run node.
    pub latest_artifacts: &'a BTreeMap<RunNodeId, LatestArtifact>,
    /// Guard expressions preloaded for every guarded edge.
    pub guards: &'a BTreeMap<GuardId, GuardExpression>,
}

// ============================================================================
// SECTION: Projection
// ============================================================================

/// A completed source whose fresh decision matched no outgoing edge and whose
/// no-route marker has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoRouteFinding {
    /// Deciding run node.
    pub run_node_id: RunNodeId,
    /// Attempt the no-route marker must record.
    pub attempt: i64,
    /// Signal of the decision that failed to route.
    pub decision: DecisionSignal,
}

/// Aggregated routing projection over one run snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingProjection {
    /// Incoming edge ids per target tree node.
    pub incoming_edges_by_target: BTreeMap<TreeNodeId, Vec<EdgeId>>,
    /// Selected outgoing edge per completed source tree node.
    pub selected_edge_by_source: BTreeMap<TreeNodeId, EdgeId>,
    /// Completed sources with routable edges but no applicable decision yet.
    pub unresolved_sources: BTreeSet<TreeNodeId>,
    /// Sources in the no-route state (persisted or pending); their targets
    /// stay unpruned while the run fails.
    pub no_route_sources: BTreeSet<TreeNodeId>,
    /// Fresh decisions that matched no edge and still need a no-route marker.
    pub no_route_pending: Vec<NoRouteFinding>,
    /// True when any source is in the no-route state (persisted or pending).
    pub has_no_route: bool,
}

// ============================================================================
// SECTION: Staleness
// ============================================================================

/// Returns true when a routing decision applies to the node's current
/// attempt.
///
/// Historical rows without a recorded attempt are always stale, and a
/// decision older than the node's latest artifact is stale. A node with no
/// artifact cannot fail the artifact-recency check.
#[must_use]
pub fn decision_applies(
    decision: &RoutingDecision,
    node: &RunNode,
    latest_artifact: Option<&LatestArtifact>,
) -> bool {
    if decision.attempt != Some(node.attempt) {
        return false;
    }
    latest_artifact.is_none_or(|artifact| decision.created_at >= artifact.created_at)
}

// ============================================================================
// SECTION: Edge Matching
// ============================================================================

/// Returns the outgoing success edges of a source in scan order.
#[must_use]
pub fn ordered_success_edges<'a>(edges: &'a [TreeEdge], source: TreeNodeId) -> Vec<&'a TreeEdge> {
    let mut outgoing: Vec<&TreeEdge> = edges
        .iter()
        .filter(|edge| edge.source_node_id == source && edge.route_on == RouteOn::Success)
        .collect();
    outgoing.sort_by(|left, right| {
        left.priority
            .cmp(&right.priority)
            .then_with(|| left.target_node_id.cmp(&right.target_node_id))
            .then_with(|| left.id.cmp(&right.id))
    });
    outgoing
}

/// Matches a decision signal against ordered outgoing edges.
///
/// Auto edges match unconditionally. Guarded edges evaluate their expression
/// against `{"decision": <signal>}`; a guarded edge without an expression
/// matches any decision. When `signal` is `None` only auto edges can match.
///
/// # Errors
///
/// Returns [`GuardError`] when a guard expression is malformed for the
/// evaluation (fatal; surfaced to the executor).
pub fn match_outgoing_edge(
    ordered_edges: &[&TreeEdge],
    signal: Option<DecisionSignal>,
    guards: &BTreeMap<GuardId, GuardExpression>,
) -> Result<Option<EdgeId>, GuardError> {
    for edge in ordered_edges {
        if edge.auto {
            return Ok(Some(edge.id));
        }
        let Some(signal) = signal else {
            continue;
        };
        let matched = match edge.guard_definition_id {
            None => true,
            Some(guard_id) => match guards.get(&guard_id) {
                Some(expression) => {
                    let context = GuardContext::for_decision(signal.as_str());
                    evaluate_guard(expression, &context)?
                }
                None => {
                    return Err(GuardError::InvalidExpression(format!(
                        "guard definition {guard_id} missing for edge {}",
                        edge.id
                    )));
                }
            },
        };
        if matched {
            return Ok(Some(edge.id));
        }
    }
    Ok(None)
}

// ============================================================================
// SECTION: Selection
// ============================================================================

/// Returns true when any outgoing edge still points at a live successor (a
/// target that is pending, running, or has no run-node row yet).
///
/// An unmatched decision is only a routing dead-end when the graph still
/// expects the flow to continue past this node; an unmatched decision whose
/// targets all already ran is a natural loop exit.
#[must_use]
pub fn has_live_successor(
    outgoing: &[&TreeEdge],
    nodes_by_tree_node: &BTreeMap<TreeNodeId, &RunNode>,
) -> bool {
    outgoing.iter().any(|edge| {
        nodes_by_tree_node.get(&edge.target_node_id).is_none_or(|target| {
            matches!(target.status, NodeStatus::Pending | NodeStatus::Running)
        })
    })
}

/// Computes the aggregated routing projection for one run snapshot.
///
/// # Errors
///
/// Returns [`GuardError`] when any guard expression fails evaluation.
pub fn select_routes(inputs: &RoutingInputs<'_>) -> Result<RoutingProjection, GuardError> {
    let mut projection = RoutingProjection::default();
    for edge in inputs.edges {
        if edge.route_on == RouteOn::Success {
            projection.incoming_edges_by_target.entry(edge.target_node_id).or_default().push(edge.id);
        }
    }
    let nodes_by_tree_node: BTreeMap<TreeNodeId, &RunNode> =
        inputs.nodes.iter().map(|node| (node.tree_node_id, node)).collect();

    for node in inputs.nodes {
        if node.status != NodeStatus::Completed {
            continue;
        }
        let outgoing = ordered_success_edges(inputs.edges, node.tree_node_id);
        if outgoing.is_empty() {
            // Terminal node: a recorded decision with nowhere to route is
            // fine, the run simply ends here.
            continue;
        }

        let fresh_decision = inputs
            .decisions
            .get(&node.id)
            .filter(|decision| {
                decision_applies(decision, node, inputs.latest_artifacts.get(&node.id))
            });

        if let Some(decision) = fresh_decision
            && decision.decision == DecisionSignal::NoRoute
        {
            projection.has_no_route = true;
            projection.no_route_sources.insert(node.tree_node_id);
            continue;
        }

        let signal = fresh_decision.map(|decision| decision.decision);
        match match_outgoing_edge(&outgoing, signal, inputs.guards)? {
            Some(edge_id) => {
                projection.selected_edge_by_source.insert(node.tree_node_id, edge_id);
            }
            None => match signal {
                Some(decision) => {
                    if has_live_successor(&outgoing, &nodes_by_tree_node) {
                        projection.has_no_route = true;
                        projection.no_route_sources.insert(node.tree_node_id);
                        projection.no_route_pending.push(NoRouteFinding {
                            run_node_id: node.id,
                            attempt: node.attempt,
                            decision,
                        });
                    }
                }
                None => {
                    projection.unresolved_sources.insert(node.tree_node_id);
                }
            },
        }
    }
    Ok(projection)
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

    use std::collections::BTreeMap;

    use super::RoutingInputs;
    use super::decision_applies;
    use super::select_routes;
    use crate::core::ArtifactId;
    use crate::core::CompareOp;
    use crate::core::DecisionId;
    use crate::core::DecisionSignal;
    use crate::core::EdgeId;
    use crate::core::GuardExpression;
    use crate::core::GuardId;
    use crate::core::GuardValue;
    use crate::core::NodeStatus;
    use crate::core::RouteOn;
    use crate::core::RoutingDecision;
    use crate::core::RunId;
    use crate::core::RunNode;
    use crate::core::RunNodeId;
    use crate::core::Timestamp;
    use crate::core::TreeEdge;
    use crate::core::TreeId;
    use crate::core::TreeNodeId;
    use crate::interfaces::LatestArtifact;

    /// Builds a run node in the given status.
    fn node(id: i64, tree_node: i64, key: &str, status: NodeStatus, attempt: i64) -> RunNode {
        RunNode {
            id: RunNodeId::from_raw(id).unwrap(),
            run_id: RunId::from_raw(1).unwrap(),
            tree_node_id: TreeNodeId::from_raw(tree_node).unwrap(),
            node_key: key.to_string(),
            status,
            attempt,
            sequence_index: id,
            started_at: None,
            completed_at: None,
            updated_at: Timestamp::from_unix_millis(0),
        }
    }

    /// Builds a success edge.
    fn edge(id: i64, source: i64, target: i64, priority: i64, auto: bool, guard: Option<i64>) -> TreeEdge {
        TreeEdge {
            id: EdgeId::from_raw(id).unwrap(),
            tree_id: TreeId::from_raw(1).unwrap(),
            source_node_id: TreeNodeId::from_raw(source).unwrap(),
            target_node_id: TreeNodeId::from_raw(target).unwrap(),
            priority,
            auto,
            guard_definition_id: guard.map(|raw| GuardId::from_raw(raw).unwrap()),
            route_on: RouteOn::Success,
        }
    }

    /// Builds a routing decision row.
    fn decision(
        id: i64,
        run_node: i64,
        signal: DecisionSignal,
        attempt: Option<i64>,
        created_at: i64,
    ) -> RoutingDecision {
        RoutingDecision {
            id: DecisionId::from_raw(id).unwrap(),
            run_id: RunId::from_raw(1).unwrap(),
            run_node_id: RunNodeId::from_raw(run_node).unwrap(),
            decision: signal,
            rationale: None,
            attempt,
            raw_output: None,
            created_at: Timestamp::from_unix_millis(created_at),
        }
    }

    /// Builds a guard matching one decision signal.
    fn signal_guard(signal: &str) -> GuardExpression {
        GuardExpression::Comparison {
            field: "decision".to_string(),
            operator: CompareOp::Eq,
            value: GuardValue::String(signal.to_string()),
        }
    }

    /// A NULL attempt or an artifact newer than the decision is stale.
    #[test]
    fn staleness_rules() {
        let source = node(1, 10, "review", NodeStatus::Completed, 2);
        let artifact = LatestArtifact {
            run_node_id: source.id,
            artifact_id: ArtifactId::from_raw(7).unwrap(),
            created_at: Timestamp::from_unix_millis(500),
        };
        let fresh = decision(1, 1, DecisionSignal::Approved, Some(2), 600);
        assert!(decision_applies(&fresh, &source, Some(&artifact)));
        let wrong_attempt = decision(2, 1, DecisionSignal::Approved, Some(1), 600);
        assert!(!decision_applies(&wrong_attempt, &source, Some(&artifact)));
        let null_attempt = decision(3, 1, DecisionSignal::Approved, None, 600);
        assert!(!decision_applies(&null_attempt, &source, Some(&artifact)));
        let older_than_artifact = decision(4, 1, DecisionSignal::Approved, Some(2), 400);
        assert!(!decision_applies(&older_than_artifact, &source, Some(&artifact)));
        let no_artifact = decision(5, 1, DecisionSignal::Approved, Some(2), 1);
        assert!(decision_applies(&no_artifact, &source, None));
    }

    /// Auto edges select without a decision; guarded edges need a fresh one.
    #[test]
    fn auto_and_guarded_selection() {
        let nodes =
            vec![node(1, 10, "design", NodeStatus::Completed, 1), node(2, 20, "review", NodeStatus::Completed, 1)];
        let edges = vec![
            edge(1, 10, 20, 0, true, None),
            edge(2, 20, 10, 10, false, Some(1)),
        ];
        let mut guards = BTreeMap::new();
        guards.insert(GuardId::from_raw(1).unwrap(), signal_guard("changes_requested"));
        let mut decisions = BTreeMap::new();
        decisions.insert(
            RunNodeId::from_raw(2).unwrap(),
            decision(1, 2, DecisionSignal::ChangesRequested, Some(1), 100),
        );
        let latest_artifacts = BTreeMap::new();
        let projection = select_routes(&RoutingInputs {
            nodes: &nodes,
            edges: &edges,
            decisions: &decisions,
            latest_artifacts: &latest_artifacts,
            guards: &guards,
        })
        .unwrap();
        assert_eq!(
            projection.selected_edge_by_source.get(&TreeNodeId::from_raw(10).unwrap()),
            Some(&EdgeId::from_raw(1).unwrap())
        );
        assert_eq!(
            projection.selected_edge_by_source.get(&TreeNodeId::from_raw(20).unwrap()),
            Some(&EdgeId::from_raw(2).unwrap())
        );
        assert!(!projection.has_no_route);
        assert!(projection.unresolved_sources.is_empty());
    }

    /// A fresh decision with no matching edge is a pending no-route finding.
    #[test]
    fn no_route_detection() {
        let nodes = vec![node(1, 10, "review", NodeStatus::Completed, 1)];
        let edges = vec![edge(1, 10, 20, 0, false, Some(1))];
        let mut guards = BTreeMap::new();
        guards.insert(GuardId::from_raw(1).unwrap(), signal_guard("changes_requested"));
        let mut decisions = BTreeMap::new();
        decisions.insert(
            RunNodeId::from_raw(1).unwrap(),
            decision(1, 1, DecisionSignal::Approved, Some(1), 100),
        );
        let latest_artifacts = BTreeMap::new();
        let projection = select_routes(&RoutingInputs {
            nodes: &nodes,
            edges: &edges,
            decisions: &decisions,
            latest_artifacts: &latest_artifacts,
            guards: &guards,
        })
        .unwrap();
        assert!(projection.has_no_route);
        assert_eq!(projection.no_route_pending.len(), 1);
        assert_eq!(projection.no_route_pending[0].decision, DecisionSignal::Approved);
    }

    /// A guarded source without a fresh decision stays unresolved, and a
    /// terminal source needs nothing at all.
    #[test]
    fn unresolved_and_terminal_sources() {
        let nodes = vec![
            node(1, 10, "review", NodeStatus::Completed, 1),
            node(2, 20, "done", NodeStatus::Completed, 1),
        ];
        let edges = vec![edge(1, 10, 20, 0, false, Some(1))];
        let mut guards = BTreeMap::new();
        guards.insert(GuardId::from_raw(1).unwrap(), signal_guard("approved"));
        let decisions = BTreeMap::new();
        let latest_artifacts = BTreeMap::new();
        let projection = select_routes(&RoutingInputs {
            nodes: &nodes,
            edges: &edges,
            decisions: &decisions,
            latest_artifacts: &latest_artifacts,
            guards: &guards,
        })
        .unwrap();
        assert!(projection.unresolved_sources.contains(&TreeNodeId::from_raw(10).unwrap()));
        assert!(!projection.unresolved_sources.contains(&TreeNodeId::from_raw(20).unwrap()));
        assert!(!projection.has_no_route);
    }

    /// An unmatched decision whose only targets already completed is a loop
    /// exit, not a dead-end.
    #[test]
    fn loop_exit_is_not_no_route() {
        let nodes = vec![
            node(1, 10, "review", NodeStatus::Completed, 2),
            node(2, 20, "implement", NodeStatus::Completed, 2),
        ];
        let edges = vec![edge(1, 10, 20, 10, false, Some(1))];
        let mut guards = BTreeMap::new();
        guards.insert(GuardId::from_raw(1).unwrap(), signal_guard("changes_requested"));
        let mut decisions = BTreeMap::new();
        decisions.insert(
            RunNodeId::from_raw(1).unwrap(),
            decision(1, 1, DecisionSignal::Approved, Some(2), 100),
        );
        let latest_artifacts = BTreeMap::new();
        let projection = select_routes(&RoutingInputs {
            nodes: &nodes,
            edges: &edges,
            decisions: &decisions,
            latest_artifacts: &latest_artifacts,
            guards: &guards,
        })
        .unwrap();
        assert!(!projection.has_no_route);
        assert!(projection.no_route_pending.is_empty());
        assert!(projection.unresolved_sources.is_empty());
    }

    /// An already-persisted no-route decision flags the run without a new
    /// pending finding.
    #[test]
    fn persisted_no_route_is_not_repersisted() {
        let nodes = vec![node(1, 10, "review", NodeStatus::Completed, 1)];
        let edges = vec![edge(1, 10, 20, 0, false, Some(1))];
        let mut guards = BTreeMap::new();
        guards.insert(GuardId::from_raw(1).unwrap(), signal_guard("changes_requested"));
        let mut decisions = BTreeMap::new();
        decisions.insert(
            RunNodeId::from_raw(1).unwrap(),
            decision(1, 1, DecisionSignal::NoRoute, Some(1), 100),
        );
        let latest_artifacts = BTreeMap::new();
        let projection = select_routes(&RoutingInputs {
            nodes: &nodes,
            edges: &edges,
            decisions: &decisions,
            latest_artifacts: &latest_artifacts,
            guards: &guards,
        })
        .unwrap();
        assert!(projection.has_no_route);
        assert!(projection.no_route_pending.is_empty());
    }
}
