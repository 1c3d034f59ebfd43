// crates/alphred-store-sqlite/tests/sqlite_store.rs
// ============================================================================
// Module: SQLite Store Tests
// Description: Contract tests for the durable workflow store.
// ============================================================================
//! ## Overview
//! Verifies guarded transitions, gap-free stream sequences, idempotent
//! diagnostics, latest-row projections, the draft lifecycle, and the retry
//! requeue against a real database file.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use alphred_core::ArtifactType;
use alphred_core::CompareOp;
use alphred_core::ContentType;
use alphred_core::GuardExpression;
use alphred_core::GuardValue;
use alphred_core::NewArtifact;
use alphred_core::NewDiagnostics;
use alphred_core::NewRoutingDecision;
use alphred_core::NewRunNode;
use alphred_core::NewStreamEvent;
use alphred_core::NewTreeEdge;
use alphred_core::NewTreeNode;
use alphred_core::NodeRole;
use alphred_core::NodeStatus;
use alphred_core::NodeTransition;
use alphred_core::NodeType;
use alphred_core::RouteOn;
use alphred_core::RunId;
use alphred_core::RunStatus;
use alphred_core::StoreError;
use alphred_core::Timestamp;
use alphred_core::TimestampAction;
use alphred_core::TreeDefinition;
use alphred_core::TreeStatus;
use alphred_core::WorkflowStore;
use alphred_store_sqlite::SqliteStoreConfig;
use alphred_store_sqlite::SqliteWorkflowStore;
use serde_json::json;
use tempfile::TempDir;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

/// Opens a store on a fresh temporary database.
fn open_store() -> (TempDir, SqliteWorkflowStore) {
    let dir = TempDir::new().unwrap();
    let config = SqliteStoreConfig::new(dir.path().join("alphred.db"));
    let store = SqliteWorkflowStore::open(&config).unwrap();
    (dir, store)
}

/// A two-node definition with one guarded edge.
fn definition() -> TreeDefinition {
    TreeDefinition {
        nodes: vec![
            NewTreeNode {
                node_key: "design".to_string(),
                node_type: NodeType::Agent,
                node_role: NodeRole::Standard,
                provider: Some("scripted".to_string()),
                model: None,
                execution_permissions: None,
                template_index: None,
                max_retries: 0,
                sequence_index: 0,
            },
            NewTreeNode {
                node_key: "implement".to_string(),
                node_type: NodeType::Agent,
                node_role: NodeRole::Standard,
                provider: Some("scripted".to_string()),
                model: None,
                execution_permissions: None,
                template_index: None,
                max_retries: 1,
                sequence_index: 1,
            },
        ],
        edges: vec![NewTreeEdge {
            source_node_key: "design".to_string(),
            target_node_key: "implement".to_string(),
            priority: 0,
            auto: false,
            guard_index: Some(0),
            route_on: RouteOn::Success,
        }],
        guards: vec![GuardExpression::Comparison {
            field: "decision".to_string(),
            operator: CompareOp::Eq,
            value: GuardValue::String("approved".to_string()),
        }],
        templates: Vec::new(),
    }
}

/// Publishes the fixture tree and materializes one run.
fn seeded_run(store: &SqliteWorkflowStore) -> RunId {
    let tree = store.create_draft_tree("demo", "Demo").unwrap();
    let revision = store.save_draft_tree(tree.id, 0, &definition()).unwrap();
    store.publish_draft_tree(tree.id, revision).unwrap();
    let published = store.find_latest_published_tree("demo").unwrap().unwrap();
    let nodes: Vec<NewRunNode> = store
        .load_tree_nodes(published.id)
        .unwrap()
        .into_iter()
        .map(|node| NewRunNode {
            tree_node_id: node.id,
            node_key: node.node_key,
            sequence_index: node.sequence_index,
        })
        .collect();
    store.create_run_with_nodes(published.id, &nodes).unwrap()
}

// ============================================================================
// SECTION: Schema and Tree Lifecycle
// ============================================================================

/// The schema initializes once and reopens cleanly.
#[test]
fn schema_initializes_and_reopens() {
    let dir = TempDir::new().unwrap();
    let config = SqliteStoreConfig::new(dir.path().join("alphred.db"));
    {
        let store = SqliteWorkflowStore::open(&config).unwrap();
        store.readiness().unwrap();
        store.create_draft_tree("demo", "Demo").unwrap();
    }
    let reopened = SqliteWorkflowStore::open(&config).unwrap();
    reopened.readiness().unwrap();
    assert!(reopened.find_latest_published_tree("demo").unwrap().is_none());
}

/// Draft saves replace content and bump the revision; publish freezes it.
#[test]
fn draft_lifecycle_round_trip() {
    let (_dir, store) = open_store();
    let tree = store.create_draft_tree("demo", "Demo").unwrap();
    assert_eq!(store.save_draft_tree(tree.id, 0, &definition()).unwrap(), 1);
    assert!(matches!(
        store.save_draft_tree(tree.id, 0, &definition()),
        Err(StoreError::Conflict(_))
    ));
    assert_eq!(store.publish_draft_tree(tree.id, 1).unwrap(), 1);

    let published = store.find_latest_published_tree("demo").unwrap().unwrap();
    assert_eq!(published.status, TreeStatus::Published);
    assert_eq!(published.draft_revision, 0);

    let nodes = store.load_tree_nodes(published.id).unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].node_key, "design");
    assert_eq!(nodes[1].max_retries, 1);

    let edges = store.load_tree_edges(published.id).unwrap();
    assert_eq!(edges.len(), 1);
    let guard_id = edges[0].guard_definition_id.unwrap();
    let guard = store.load_guard(guard_id).unwrap().unwrap();
    assert!(matches!(guard.expression, GuardExpression::Comparison { .. }));
}

// ============================================================================
// SECTION: Guarded Transitions
// ============================================================================

/// Run transitions enforce expected status and stamp timestamps.
#[test]
fn run_transitions_are_guarded() {
    let (_dir, store) = open_store();
    let run_id = seeded_run(&store);
    let run = store.load_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    assert!(run.started_at.is_none());

    store.transition_run(run_id, RunStatus::Pending, RunStatus::Running).unwrap();
    let running = store.load_run(run_id).unwrap().unwrap();
    assert!(running.started_at.is_some());
    assert!(running.completed_at.is_none());

    // A stale expectation misses the row.
    assert!(matches!(
        store.transition_run(run_id, RunStatus::Pending, RunStatus::Running),
        Err(StoreError::Precondition { .. })
    ));
    // Disallowed pairs are rejected before touching the database.
    assert!(matches!(
        store.transition_run(run_id, RunStatus::Running, RunStatus::Pending),
        Err(StoreError::Invalid(_))
    ));

    store.transition_run(run_id, RunStatus::Running, RunStatus::Completed).unwrap();
    let completed = store.load_run(run_id).unwrap().unwrap();
    assert_eq!(completed.status, RunStatus::Completed);
    assert!(completed.completed_at.is_some());
    assert!(completed.updated_at >= completed.created_at);
}

/// Node transitions enforce status and attempt, and revisits reset
/// timestamps while bumping the attempt.
#[test]
fn node_transitions_are_guarded() {
    let (_dir, store) = open_store();
    let run_id = seeded_run(&store);
    let design = store.load_run_nodes(run_id).unwrap().remove(0);
    assert_eq!(design.status, NodeStatus::Pending);
    assert_eq!(design.attempt, 1);

    store
        .transition_node(&NodeTransition {
            run_node_id: design.id,
            expected_status: NodeStatus::Pending,
            expected_attempt: 1,
            new_status: NodeStatus::Running,
            increment_attempt: false,
            started_at: TimestampAction::SetNow,
            completed_at: TimestampAction::Keep,
        })
        .unwrap();

    // Wrong attempt: row-count miss.
    assert!(matches!(
        store.transition_node(&NodeTransition {
            run_node_id: design.id,
            expected_status: NodeStatus::Running,
            expected_attempt: 2,
            new_status: NodeStatus::Completed,
            increment_attempt: false,
            started_at: TimestampAction::Keep,
            completed_at: TimestampAction::SetNow,
        }),
        Err(StoreError::Precondition { .. })
    ));

    store
        .transition_node(&NodeTransition {
            run_node_id: design.id,
            expected_status: NodeStatus::Running,
            expected_attempt: 1,
            new_status: NodeStatus::Completed,
            increment_attempt: false,
            started_at: TimestampAction::Keep,
            completed_at: TimestampAction::SetNow,
        })
        .unwrap();
    let completed = store.load_run_node(design.id).unwrap().unwrap();
    assert!(completed.started_at.is_some());
    assert!(completed.completed_at.is_some());

    // Revisit: completed -> pending with attempt + 1 and cleared stamps.
    store
        .transition_node(&NodeTransition {
            run_node_id: design.id,
            expected_status: NodeStatus::Completed,
            expected_attempt: 1,
            new_status: NodeStatus::Pending,
            increment_attempt: true,
            started_at: TimestampAction::Clear,
            completed_at: TimestampAction::Clear,
        })
        .unwrap();
    let revisited = store.load_run_node(design.id).unwrap().unwrap();
    assert_eq!(revisited.status, NodeStatus::Pending);
    assert_eq!(revisited.attempt, 2);
    assert!(revisited.started_at.is_none());
    assert!(revisited.completed_at.is_none());
}

// ============================================================================
// SECTION: Artifacts, Decisions, Diagnostics, Streams
// ============================================================================

/// The latest-artifact projection picks the highest id per run node.
#[test]
fn latest_artifact_projection() {
    let (_dir, store) = open_store();
    let run_id = seeded_run(&store);
    let nodes = store.load_run_nodes(run_id).unwrap();
    for content in ["v1", "v2"] {
        store
            .insert_artifact(&NewArtifact {
                run_id,
                run_node_id: nodes[0].id,
                artifact_type: ArtifactType::Report,
                content_type: ContentType::Markdown,
                content: content.to_string(),
                metadata: json!({}),
            })
            .unwrap();
    }
    store
        .insert_artifact(&NewArtifact {
            run_id,
            run_node_id: nodes[1].id,
            artifact_type: ArtifactType::Log,
            content_type: ContentType::Text,
            content: "log".to_string(),
            metadata: json!({}),
        })
        .unwrap();

    let latest = store.latest_artifacts_by_run_node(run_id).unwrap();
    assert_eq!(latest.len(), 2);
    let design_latest = latest.iter().find(|entry| entry.run_node_id == nodes[0].id).unwrap();
    let artifacts = store.load_artifacts(run_id).unwrap();
    assert_eq!(
        artifacts.iter().filter(|artifact| artifact.run_node_id == nodes[0].id).count(),
        2
    );
    assert_eq!(
        design_latest.artifact_id,
        artifacts
            .iter()
            .filter(|artifact| artifact.run_node_id == nodes[0].id)
            .map(|artifact| artifact.id)
            .max()
            .unwrap()
    );
}

/// The latest-decision projection orders by `(created_at, id)`.
#[test]
fn latest_decision_projection() {
    let (_dir, store) = open_store();
    let run_id = seeded_run(&store);
    let node = store.load_run_nodes(run_id).unwrap().remove(0);
    for signal in [
        alphred_core::DecisionSignal::ChangesRequested,
        alphred_core::DecisionSignal::Approved,
    ] {
        store
            .insert_routing_decision(&NewRoutingDecision {
                run_id,
                run_node_id: node.id,
                decision: signal,
                rationale: None,
                attempt: Some(1),
                raw_output: None,
            })
            .unwrap();
    }
    let latest = store.latest_routing_decisions(run_id).unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].decision, alphred_core::DecisionSignal::Approved);
    assert_eq!(latest[0].attempt, Some(1));
}

/// Diagnostics inserts are idempotent per `(run, node, attempt)`.
#[test]
fn diagnostics_insert_is_idempotent() {
    let (_dir, store) = open_store();
    let run_id = seeded_run(&store);
    let node = store.load_run_nodes(run_id).unwrap().remove(0);
    let row = NewDiagnostics {
        run_id,
        run_node_id: node.id,
        attempt: 1,
        outcome: "completed".to_string(),
        counts: json!({"message": 2}),
        redacted: false,
        truncated: false,
        payload_chars: 120,
        diagnostics: json!({"schema_version": 1}),
    };
    assert!(store.insert_diagnostics(&row).unwrap());
    assert!(!store.insert_diagnostics(&row).unwrap());
    let rows = store.load_diagnostics(run_id, node.id).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].counts["message"], 2);
}

/// Stream sequences continue gap-free across separate appends.
#[test]
fn stream_sequences_are_gap_free() {
    let (_dir, store) = open_store();
    let run_id = seeded_run(&store);
    let node = store.load_run_nodes(run_id).unwrap().remove(0);
    let event = |label: &str| NewStreamEvent {
        event_type: label.to_string(),
        timestamp: Timestamp::from_unix_millis(1_700_000_000_000),
        content_chars: 4,
        content_preview: Some("body".to_string()),
        metadata: None,
        usage_delta_tokens: Some(2),
        usage_cumulative_tokens: Some(2),
    };
    let first = store
        .append_stream_events(run_id, node.id, 1, &[event("message"), event("message")])
        .unwrap();
    assert_eq!(first, 1);
    let second = store.append_stream_events(run_id, node.id, 1, &[event("tool_use")]).unwrap();
    assert_eq!(second, 3);
    // A new attempt starts its own sequence.
    let fresh = store.append_stream_events(run_id, node.id, 2, &[event("message")]).unwrap();
    assert_eq!(fresh, 1);

    let events = store.stream_events_after(node.id, 1, 0).unwrap();
    let sequences: Vec<i64> = events.iter().map(|event| event.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    let resumed = store.stream_events_after(node.id, 1, 1).unwrap();
    assert_eq!(resumed.len(), 2);
}

// ============================================================================
// SECTION: Retry Requeue and Worktrees
// ============================================================================

/// The transactional requeue flips failed nodes to pending and the run back
/// to running.
#[test]
fn requeue_failed_nodes_round_trip() {
    let (_dir, store) = open_store();
    let run_id = seeded_run(&store);
    let node = store.load_run_nodes(run_id).unwrap().remove(0);
    store.transition_run(run_id, RunStatus::Pending, RunStatus::Running).unwrap();
    store
        .transition_node(&NodeTransition {
            run_node_id: node.id,
            expected_status: NodeStatus::Pending,
            expected_attempt: 1,
            new_status: NodeStatus::Running,
            increment_attempt: false,
            started_at: TimestampAction::SetNow,
            completed_at: TimestampAction::Keep,
        })
        .unwrap();
    store
        .transition_node(&NodeTransition {
            run_node_id: node.id,
            expected_status: NodeStatus::Running,
            expected_attempt: 1,
            new_status: NodeStatus::Failed,
            increment_attempt: false,
            started_at: TimestampAction::Keep,
            completed_at: TimestampAction::SetNow,
        })
        .unwrap();
    store.transition_run(run_id, RunStatus::Running, RunStatus::Failed).unwrap();

    let requeued = store.requeue_failed_nodes(run_id).unwrap();
    assert_eq!(requeued, vec![node.id]);
    let run = store.load_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.completed_at.is_none());
    let requeued_node = store.load_run_node(node.id).unwrap().unwrap();
    assert_eq!(requeued_node.status, NodeStatus::Pending);
    assert_eq!(requeued_node.attempt, 2);

    // Requeue on a non-failed run misses its precondition.
    assert!(matches!(
        store.requeue_failed_nodes(run_id),
        Err(StoreError::Precondition { .. })
    ));
}

/// The latest active worktree wins; other statuses are ignored.
#[test]
fn latest_active_worktree_lookup() {
    let (_dir, store) = open_store();
    let run_id = seeded_run(&store);
    assert!(store.latest_active_worktree(run_id).unwrap().is_none());
    store.insert_worktree(run_id, "/tmp/wt-1", "active").unwrap();
    store.insert_worktree(run_id, "/tmp/wt-2", "active").unwrap();
    store.insert_worktree(run_id, "/tmp/wt-3", "pruned").unwrap();
    let latest = store.latest_active_worktree(run_id).unwrap().unwrap();
    assert_eq!(latest.path, "/tmp/wt-2");
}
