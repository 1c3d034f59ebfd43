// crates/alphred-core/tests/run_controls.rs
// ============================================================================
// Module: Run Control Tests
// Description: Cancel/pause/resume/retry semantics and idempotence laws.
// ============================================================================
//! ## Overview
//! Exercises the operator controls against the in-memory store: idempotent
//! no-ops, invalid transitions, the transactional retry requeue, and the
//! cancel-then-run round trip.

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

mod support;

use std::sync::Arc;

use alphred_core::ControlError;
use alphred_core::ControlOutcome;
use alphred_core::DecisionSignal;
use alphred_core::InMemoryWorkflowStore;
use alphred_core::NodeStatus;
use alphred_core::RunControlAction;
use alphred_core::RunId;
use alphred_core::RunStatus;
use alphred_core::StepOutcome;
use alphred_core::SystemClock;
use alphred_core::WorkflowExecutor;
use alphred_core::WorkflowStore;
use alphred_core::control_run;
use alphred_core::materialize_run;
use support::StubPhase;
use support::StubProvider;
use support::StubResolver;
use support::linear_definition;
use support::options;
use support::publish_tree;

// ============================================================================
// SECTION: Wiring
// ============================================================================

/// Publishes the linear tree and materializes a run.
fn pending_run(store: &InMemoryWorkflowStore) -> RunId {
    publish_tree(store, "demo", &linear_definition(0));
    materialize_run(store, "demo").unwrap()
}

/// Builds an executor over the store with a scripted stub.
fn executor_with(
    store: &InMemoryWorkflowStore,
    provider: Arc<StubProvider>,
) -> WorkflowExecutor<InMemoryWorkflowStore, StubResolver, SystemClock> {
    WorkflowExecutor::new(
        store.clone(),
        StubResolver {
            provider,
        },
        SystemClock,
    )
}

// ============================================================================
// SECTION: Cancel
// ============================================================================

/// Cancel applies from pending and is a no-op on a cancelled run.
#[test]
fn cancel_applies_then_noops() {
    let store = InMemoryWorkflowStore::new();
    let run_id = pending_run(&store);

    let applied = control_run(&store, run_id, RunControlAction::Cancel).unwrap();
    assert_eq!(applied.outcome, ControlOutcome::Applied);
    assert_eq!(applied.previous_run_status, RunStatus::Pending);
    assert_eq!(applied.run_status, RunStatus::Cancelled);
    assert!(applied.retried_run_node_ids.is_empty());

    let noop = control_run(&store, run_id, RunControlAction::Cancel).unwrap();
    assert_eq!(noop.outcome, ControlOutcome::Noop);
    assert_eq!(noop.run_status, RunStatus::Cancelled);
}

/// Cancelling a completed run is an invalid transition.
#[test]
fn cancel_completed_is_invalid() {
    let store = InMemoryWorkflowStore::new();
    let run_id = pending_run(&store);
    let provider = Arc::new(StubProvider::new());
    for key in ["design", "implement", "review"] {
        provider.push(key, StubPhase::success("ok", DecisionSignal::Approved));
    }
    executor_with(&store, provider).execute_run(run_id, &options(), 1_000).unwrap();

    let denied = control_run(&store, run_id, RunControlAction::Cancel);
    assert!(matches!(
        denied,
        Err(ControlError::InvalidTransition {
            action: RunControlAction::Cancel,
            status: RunStatus::Completed,
        })
    ));
}

/// A run loop after cancel observes the terminal status and writes nothing.
#[test]
fn execute_run_after_cancel_is_terminal() {
    let store = InMemoryWorkflowStore::new();
    let run_id = pending_run(&store);
    control_run(&store, run_id, RunControlAction::Cancel).unwrap();

    let provider = Arc::new(StubProvider::new());
    let result =
        executor_with(&store, provider).execute_run(run_id, &options(), 1_000).unwrap();
    assert_eq!(result.executed_nodes, 0);
    assert_eq!(
        result.final_step,
        StepOutcome::RunTerminal {
            run_status: RunStatus::Cancelled,
        }
    );
    assert!(store.load_artifacts(run_id).unwrap().is_empty());
}

// ============================================================================
// SECTION: Pause / Resume
// ============================================================================

/// Pause blocks further scheduling; resume is applied then noop.
#[test]
fn pause_blocks_and_resume_is_idempotent() {
    let store = InMemoryWorkflowStore::new();
    let run_id = pending_run(&store);
    let provider = Arc::new(StubProvider::new());
    provider.push("design", StubPhase::success("ok", DecisionSignal::Approved));
    let executor = executor_with(&store, Arc::clone(&provider));
    let first = executor.execute_next_runnable_node(run_id, &options()).unwrap();
    assert!(matches!(first, StepOutcome::Executed { .. }));

    let paused = control_run(&store, run_id, RunControlAction::Pause).unwrap();
    assert_eq!(paused.outcome, ControlOutcome::Applied);
    assert_eq!(paused.run_status, RunStatus::Paused);

    let blocked = executor.execute_next_runnable_node(run_id, &options()).unwrap();
    assert_eq!(
        blocked,
        StepOutcome::Blocked {
            run_status: RunStatus::Paused,
        }
    );

    let resumed = control_run(&store, run_id, RunControlAction::Resume).unwrap();
    assert_eq!(resumed.outcome, ControlOutcome::Applied);
    assert_eq!(resumed.run_status, RunStatus::Running);
    let noop = control_run(&store, run_id, RunControlAction::Resume).unwrap();
    assert_eq!(noop.outcome, ControlOutcome::Noop);
    assert_eq!(noop.run_status, RunStatus::Running);

    // Pausing a pending run is invalid.
    let fresh = materialize_run(&store, "demo").unwrap();
    assert!(matches!(
        control_run(&store, fresh, RunControlAction::Pause),
        Err(ControlError::InvalidTransition { .. })
    ));
}

// ============================================================================
// SECTION: Retry
// ============================================================================

/// Retry requeues every failed latest-attempt node with attempt + 1 and sets
/// the run running; retrying again is a no-op.
#[test]
fn retry_requeues_failed_nodes() {
    let store = InMemoryWorkflowStore::new();
    let run_id = pending_run(&store);
    let provider = Arc::new(StubProvider::new());
    provider.push("design", StubPhase::success("ok", DecisionSignal::Approved));
    provider.push("implement", StubPhase::failure("provider_crash", "boom"));
    let executor = executor_with(&store, Arc::clone(&provider));
    executor.execute_run(run_id, &options(), 1_000).unwrap();
    assert_eq!(store.load_run(run_id).unwrap().unwrap().status, RunStatus::Failed);

    let implement_before = store
        .load_run_nodes(run_id)
        .unwrap()
        .into_iter()
        .find(|node| node.node_key == "implement")
        .unwrap();
    assert_eq!(implement_before.status, NodeStatus::Failed);
    assert_eq!(implement_before.attempt, 1);

    let retried = control_run(&store, run_id, RunControlAction::Retry).unwrap();
    assert_eq!(retried.outcome, ControlOutcome::Applied);
    assert_eq!(retried.run_status, RunStatus::Running);
    assert_eq!(retried.retried_run_node_ids, vec![implement_before.id]);

    let implement_after = store.load_run_node(implement_before.id).unwrap().unwrap();
    assert_eq!(implement_after.status, NodeStatus::Pending);
    assert_eq!(implement_after.attempt, 2);
    assert!(implement_after.started_at.is_none());
    assert!(implement_after.completed_at.is_none());

    // Retry on a running run is a no-op; the requeued node finishes the run.
    let noop = control_run(&store, run_id, RunControlAction::Retry).unwrap();
    assert_eq!(noop.outcome, ControlOutcome::Noop);

    provider.push("implement", StubPhase::success("fixed", DecisionSignal::Approved));
    provider.push("review", StubPhase::success("ship", DecisionSignal::Approved));
    let result = executor.execute_run(run_id, &options(), 1_000).unwrap();
    assert_eq!(result.final_step.run_status(), RunStatus::Completed);
}

/// Retry on a failed run without failed latest-attempt nodes reports missing
/// targets.
#[test]
fn retry_without_targets_errors() {
    let store = InMemoryWorkflowStore::new();
    let run_id = pending_run(&store);
    // Force the run failed without failing any node.
    store.transition_run(run_id, RunStatus::Pending, RunStatus::Running).unwrap();
    store.transition_run(run_id, RunStatus::Running, RunStatus::Failed).unwrap();

    let denied = control_run(&store, run_id, RunControlAction::Retry);
    assert!(matches!(denied, Err(ControlError::RetryTargetsNotFound(id)) if id == run_id));
    // The run was left untouched.
    assert_eq!(store.load_run(run_id).unwrap().unwrap().status, RunStatus::Failed);
}

/// Retry from a non-failed, non-running status is invalid.
#[test]
fn retry_from_pending_is_invalid() {
    let store = InMemoryWorkflowStore::new();
    let run_id = pending_run(&store);
    assert!(matches!(
        control_run(&store, run_id, RunControlAction::Retry),
        Err(ControlError::InvalidTransition {
            action: RunControlAction::Retry,
            status: RunStatus::Pending,
        })
    ));
}

// ============================================================================
// SECTION: Deferred Retry Under Pause
// ============================================================================

/// A failure while the run is paused requeues the node instead of retrying
/// in place.
#[test]
fn paused_failure_defers_retry() {
    let store = InMemoryWorkflowStore::new();
    publish_tree(
        &store,
        "demo",
        &alphred_core::TreeDefinition {
            nodes: vec![support::agent_node("design", 0, 1)],
            edges: Vec::new(),
            guards: Vec::new(),
            templates: Vec::new(),
        },
    );
    let run_id = materialize_run(&store, "demo").unwrap();
    let provider = Arc::new(StubProvider::new());
    let pause_store = store.clone();
    provider.push(
        "design",
        StubPhase::failure("provider_crash", "boom").with_hook(Box::new(move || {
            control_run(&pause_store, run_id, RunControlAction::Pause).unwrap();
        })),
    );
    let executor = executor_with(&store, Arc::clone(&provider));
    let step = executor.execute_next_runnable_node(run_id, &options()).unwrap();
    let StepOutcome::Executed {
        node_status,
        run_status,
        ..
    } = step
    else {
        panic!("expected an executed step, got {step:?}");
    };
    assert_eq!(node_status, NodeStatus::Pending);
    assert_eq!(run_status, RunStatus::Paused);

    let design = store
        .load_run_nodes(run_id)
        .unwrap()
        .into_iter()
        .find(|node| node.node_key == "design")
        .unwrap();
    assert_eq!(design.status, NodeStatus::Pending);
    assert_eq!(design.attempt, 2);

    // After resume, the deferred attempt runs and completes the run.
    control_run(&store, run_id, RunControlAction::Resume).unwrap();
    provider.push("design", StubPhase::success("recovered", DecisionSignal::Approved));
    let result = executor.execute_run(run_id, &options(), 1_000).unwrap();
    assert_eq!(result.final_step.run_status(), RunStatus::Completed);
    let diagnostics = store.load_diagnostics(run_id, design.id).unwrap();
    assert_eq!(diagnostics[0].outcome, "deferred_retry");
}
