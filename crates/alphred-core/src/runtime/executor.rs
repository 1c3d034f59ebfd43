// crates/alphred-core/src/runtime/executor.rs
// ============================================================================
// Module: Alphred Workflow Executor
// Description: Single-step scheduler with retry, routing, and diagnostics.
// Purpose: Advance one run node per step under optimistic concurrency.
// Dependencies: crate::{context, core, diagnostics, graph, interfaces}
// ============================================================================

//! ## Overview
//! One step is claim -> execute -> route -> transition for a single node.
//! Nothing in a step holds a lock across suspension points; every mutation is
//! a guarded update and a row-count miss means another worker won the race,
//! in which case the step returns `blocked` and the next step re-reads. The
//! run loop simply repeats steps until a non-executed outcome appears.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::context::ContextAssembly;
use crate::context::ContextCandidate;
use crate::context::assemble_context;
use crate::core::ArtifactType;
use crate::core::Clock;
use crate::core::ContentType;
use crate::core::DecisionSignal;
use crate::core::EdgeId;
use crate::core::ExecutionPermissions;
use crate::core::GuardError;
use crate::core::GuardExpression;
use crate::core::GuardId;
use crate::core::NodeStatus;
use crate::core::RoutingDecision;
use crate::core::RunId;
use crate::core::RunNode;
use crate::core::RunNodeId;
use crate::core::RunStatus;
use crate::core::TreeEdge;
use crate::core::TreeNode;
use crate::core::TreeNodeId;
use crate::core::WorkflowRun;
use crate::diagnostics::AttemptError;
use crate::diagnostics::SanitizedEvent;
use crate::diagnostics::TokenUsage;
use crate::diagnostics::build_attempt_diagnostics;
use crate::diagnostics::sanitize_event;
use crate::diagnostics::stack_preview;
use crate::graph::ClaimKind;
use crate::graph::RoutingInputs;
use crate::graph::RoutingProjection;
use crate::graph::compute_unreachable_pending;
use crate::graph::find_next_runnable;
use crate::graph::has_live_successor;
use crate::graph::latest_artifacts_map;
use crate::graph::latest_decisions_map;
use crate::graph::latest_run_node_attempts;
use crate::graph::match_outgoing_edge;
use crate::graph::ordered_success_edges;
use crate::graph::select_routes;
use crate::interfaces::LatestArtifact;
use crate::interfaces::NewArtifact;
use crate::interfaces::NewDiagnostics;
use crate::interfaces::NewRoutingDecision;
use crate::interfaces::NewStreamEvent;
use crate::interfaces::NodeTransition;
use crate::interfaces::PhaseOutput;
use crate::interfaces::PhaseRequest;
use crate::interfaces::ProviderError;
use crate::interfaces::ProviderEvent;
use crate::interfaces::ProviderResolver;
use crate::interfaces::StoreError;
use crate::interfaces::TimestampAction;
use crate::interfaces::WorkflowStore;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default step ceiling for [`WorkflowExecutor::execute_run`].
pub const DEFAULT_MAX_RUN_STEPS: u64 = 1_000;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Executor errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Run does not exist.
    #[error("workflow run not found: {0}")]
    RunNotFound(RunId),
    /// Internal invariant violated (missing tree rows, unresolved lookups).
    #[error("executor internal error: {0}")]
    Internal(String),
    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Guard expression failed evaluation.
    #[error(transparent)]
    Guard(#[from] GuardError),
}

// ============================================================================
// SECTION: Options and Outcomes
// ============================================================================

/// Hook fired when a step observes the run entering a terminal status.
pub type RunTerminalHook = Arc<dyn Fn(RunId, RunStatus) + Send + Sync>;

/// Per-call execution options.
#[derive(Clone)]
pub struct ExecutionOptions {
    /// Provider used when a node names none.
    pub default_provider: String,
    /// Run-level execution permissions (node overrides overlay these).
    pub base_permissions: ExecutionPermissions,
    /// Working directory resolved for the run.
    pub working_directory: Option<String>,
    /// Fired at most once per step, when that step drove the run terminal.
    pub on_run_terminal: Option<RunTerminalHook>,
}

impl ExecutionOptions {
    /// Creates options with the given fallback provider.
    #[must_use]
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            default_provider: default_provider.into(),
            base_permissions: ExecutionPermissions::default(),
            working_directory: None,
            on_run_terminal: None,
        }
    }
}

impl fmt::Debug for ExecutionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionOptions")
            .field("default_provider", &self.default_provider)
            .field("base_permissions", &self.base_permissions)
            .field("working_directory", &self.working_directory)
            .field("on_run_terminal", &self.on_run_terminal.is_some())
            .finish()
    }
}

/// Result of one scheduler step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// A node was claimed and executed (successfully or not).
    Executed {
        /// Executed run node.
        run_node_id: RunNodeId,
        /// Node key of the executed node.
        node_key: String,
        /// Attempt that settled in this step.
        attempt: i64,
        /// Node status after the step.
        node_status: NodeStatus,
        /// Run status after the step.
        run_status: RunStatus,
    },
    /// The run is already terminal; nothing was touched.
    RunTerminal {
        /// Observed terminal run status.
        run_status: RunStatus,
    },
    /// The step could not advance (paused run, lost claim race, routing
    /// dead-end).
    Blocked {
        /// Run status after the step.
        run_status: RunStatus,
    },
    /// No node is runnable; the run was settled toward a final status.
    NoRunnable {
        /// Run status after the step.
        run_status: RunStatus,
    },
}

impl StepOutcome {
    /// Returns the run status carried by the outcome.
    #[must_use]
    pub const fn run_status(&self) -> RunStatus {
        match self {
            Self::Executed {
                run_status, ..
            }
            | Self::RunTerminal {
                run_status,
            }
            | Self::Blocked {
                run_status,
            }
            | Self::NoRunnable {
                run_status,
            } => *run_status,
        }
    }
}

/// Result of a run loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    /// Number of `executed` steps performed.
    pub executed_nodes: u64,
    /// The step that ended the loop.
    pub final_step: StepOutcome,
}

// ============================================================================
// SECTION: Graph Snapshot
// ============================================================================

/// One consistent read of everything a step scans.
struct GraphSnapshot {
    /// Tree nodes by id.
    tree_nodes: BTreeMap<TreeNodeId, TreeNode>,
    /// All edges of the run's tree.
    edges: Vec<TreeEdge>,
    /// Latest-attempt run nodes in canonical order.
    nodes: Vec<RunNode>,
    /// Latest routing decision per run node.
    decisions: BTreeMap<RunNodeId, RoutingDecision>,
    /// Latest artifact per run node.
    latest_artifacts: BTreeMap<RunNodeId, LatestArtifact>,
    /// Guard expressions for every guarded edge present in storage.
    guards: BTreeMap<GuardId, GuardExpression>,
}

impl GraphSnapshot {
    /// Looks up the latest-attempt row for a tree node.
    fn node_for_tree_node(&self, tree_node_id: TreeNodeId) -> Option<&RunNode> {
        self.nodes.iter().find(|node| node.tree_node_id == tree_node_id)
    }
}

// ============================================================================
// SECTION: Stream Sink
// ============================================================================

/// Callback target persisting provider events as they arrive.
struct StreamSink<'a, S: WorkflowStore, C: Clock> {
    /// Store session events are appended through.
    store: &'a S,
    /// Clock stamping event arrival.
    clock: &'a C,
    /// Owning run.
    run_id: RunId,
    /// Producing run node.
    run_node_id: RunNodeId,
    /// Attempt the events belong to.
    attempt: i64,
    /// Token accounting across the stream.
    usage: TokenUsage,
    /// Sanitized events retained for the attempt payload.
    sanitized: Vec<SanitizedEvent>,
    /// True when any redaction fired.
    redacted: bool,
    /// First persistence error, surfaced after the phase settles.
    first_error: Option<StoreError>,
}

impl<'a, S: WorkflowStore, C: Clock> StreamSink<'a, S, C> {
    /// Creates a sink for one attempt.
    fn new(store: &'a S, clock: &'a C, run_id: RunId, run_node_id: RunNodeId, attempt: i64) -> Self {
        Self {
            store,
            clock,
            run_id,
            run_node_id,
            attempt,
            usage: TokenUsage::new(),
            sanitized: Vec::new(),
            redacted: false,
            first_error: None,
        }
    }

    /// Sanitizes and persists one event.
    fn push(&mut self, event: &ProviderEvent) {
        let index = self.sanitized.len();
        let record = sanitize_event(index, event, &mut self.usage);
        self.redacted |= record.redacted;
        let row = NewStreamEvent {
            event_type: record.event.event_type.clone(),
            timestamp: self.clock.now(),
            content_chars: i64::try_from(record.event.content_chars).unwrap_or(i64::MAX),
            content_preview: record.event.content_preview.clone(),
            metadata: record.event.metadata.clone(),
            usage_delta_tokens: record
                .event
                .delta_tokens
                .map(|tokens| i64::try_from(tokens).unwrap_or(i64::MAX)),
            usage_cumulative_tokens: record
                .event
                .cumulative_tokens
                .map(|tokens| i64::try_from(tokens).unwrap_or(i64::MAX)),
        };
        if self.first_error.is_none()
            && let Err(error) =
                self.store.append_stream_events(self.run_id, self.run_node_id, self.attempt, &[row])
        {
            self.first_error = Some(error);
        }
        self.sanitized.push(record.event);
    }
}

// ============================================================================
// SECTION: Executor
// ============================================================================

/// Single-step workflow executor.
///
/// # Invariants
/// - Holds no state between steps; every step re-reads the database.
/// - All status mutations are guarded; races surface as `blocked` outcomes.
pub struct WorkflowExecutor<S, R, C> {
    /// Store session.
    store: S,
    /// Provider resolver.
    resolver: R,
    /// Clock for manifest and event timestamps.
    clock: C,
}

/// What failure handling decided to do next.
enum FailureNext {
    /// Retry immediately with the refreshed node row.
    RetryImmediate(RunNode),
    /// The attempt is settled; return this outcome.
    Settled(StepOutcome),
}

impl<S, R, C> WorkflowExecutor<S, R, C>
where
    S: WorkflowStore,
    R: ProviderResolver,
    C: Clock,
{
    /// Creates an executor over a store session and provider resolver.
    pub const fn new(store: S, resolver: R, clock: C) -> Self {
        Self {
            store,
            resolver,
            clock,
        }
    }

    /// Returns the underlying store session.
    pub const fn store(&self) -> &S {
        &self.store
    }

    // ------------------------------------------------------------------
    // Run transitions
    // ------------------------------------------------------------------

    /// Applies `from -> to`, composing through `running` when the target is
    /// terminal so terminal transitions never jump states.
    fn transition_run_to(
        &self,
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<(), StoreError> {
        if from == to {
            return Ok(());
        }
        if to.is_terminal() && matches!(from, RunStatus::Pending | RunStatus::Paused) {
            self.store.transition_run(run_id, from, RunStatus::Running)?;
            return self.store.transition_run(run_id, RunStatus::Running, to);
        }
        self.store.transition_run(run_id, from, to)
    }

    /// Re-reads the run and moves it toward `desired`, short-circuiting on
    /// terminal statuses and treating `paused -> running` as a no-op so
    /// external pauses survive mid-execution.
    fn transition_run_to_current(
        &self,
        run_id: RunId,
        desired: RunStatus,
    ) -> Result<RunStatus, ExecutorError> {
        for _ in 0 .. 3 {
            let run = self.require_run(run_id)?;
            if run.status.is_terminal() {
                return Ok(run.status);
            }
            if run.status == desired {
                return Ok(desired);
            }
            if run.status == RunStatus::Paused && desired == RunStatus::Running {
                return Ok(RunStatus::Paused);
            }
            match self.transition_run_to(run_id, run.status, desired) {
                Ok(()) => return Ok(desired),
                Err(error) if error.is_precondition() => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(self.require_run(run_id)?.status)
    }

    /// Loads the run or raises [`ExecutorError::RunNotFound`].
    fn require_run(&self, run_id: RunId) -> Result<WorkflowRun, ExecutorError> {
        self.store.load_run(run_id)?.ok_or(ExecutorError::RunNotFound(run_id))
    }

    // ------------------------------------------------------------------
    // Snapshot loading
    // ------------------------------------------------------------------

    /// Loads one consistent graph snapshot for a run.
    fn load_snapshot(&self, run: &WorkflowRun) -> Result<GraphSnapshot, ExecutorError> {
        let tree_nodes: BTreeMap<TreeNodeId, TreeNode> = self
            .store
            .load_tree_nodes(run.tree_id)?
            .into_iter()
            .map(|node| (node.id, node))
            .collect();
        if tree_nodes.is_empty() {
            return Err(ExecutorError::Internal(format!(
                "workflow tree {} has no nodes for run {}",
                run.tree_id, run.id
            )));
        }
        let edges = self.store.load_tree_edges(run.tree_id)?;
        let mut guards = BTreeMap::new();
        let guard_ids: BTreeSet<GuardId> =
            edges.iter().filter_map(|edge| edge.guard_definition_id).collect();
        for guard_id in guard_ids {
            if let Some(definition) = self.store.load_guard(guard_id)? {
                guards.insert(guard_id, definition.expression);
            }
        }
        let nodes = latest_run_node_attempts(&self.store.load_run_nodes(run.id)?);
        let decisions = latest_decisions_map(&self.store.latest_routing_decisions(run.id)?);
        let latest_artifacts = latest_artifacts_map(&self.store.latest_artifacts_by_run_node(run.id)?);
        Ok(GraphSnapshot {
            tree_nodes,
            edges,
            nodes,
            decisions,
            latest_artifacts,
            guards,
        })
    }

    /// Computes the routing projection over a snapshot.
    fn project(&self, snapshot: &GraphSnapshot) -> Result<RoutingProjection, ExecutorError> {
        Ok(select_routes(&RoutingInputs {
            nodes: &snapshot.nodes,
            edges: &snapshot.edges,
            decisions: &snapshot.decisions,
            latest_artifacts: &snapshot.latest_artifacts,
            guards: &snapshot.guards,
        })?)
    }

    // ------------------------------------------------------------------
    // Single step
    // ------------------------------------------------------------------

    /// Advances the run by at most one node.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError`] on storage failures, malformed guards, or
    /// violated internal invariants. Concurrency races are NOT errors; they
    /// surface as [`StepOutcome::Blocked`].
    pub fn execute_next_runnable_node(
        &self,
        run_id: RunId,
        options: &ExecutionOptions,
    ) -> Result<StepOutcome, ExecutorError> {
        let run = self.require_run(run_id)?;
        if run.status.is_terminal() {
            return Ok(StepOutcome::RunTerminal {
                run_status: run.status,
            });
        }

        let snapshot = self.load_snapshot(&run)?;
        let projection = self.project(&snapshot)?;
        self.persist_no_route_markers(run_id, &projection)?;
        let next =
            find_next_runnable(&snapshot.nodes, &snapshot.edges, &projection, &snapshot.latest_artifacts);

        // Optimistic refresh: honor controls applied while we were reading.
        let run = self.require_run(run_id)?;
        if run.status.is_terminal() {
            return Ok(StepOutcome::RunTerminal {
                run_status: run.status,
            });
        }
        if run.status == RunStatus::Paused && next.is_some() {
            return Ok(StepOutcome::Blocked {
                run_status: RunStatus::Paused,
            });
        }

        let Some(next) = next else {
            return self.resolve_no_runnable(run_id, &snapshot, &projection);
        };

        let status = self.transition_run_to_current(run_id, RunStatus::Running)?;
        if status.is_terminal() {
            return Ok(StepOutcome::RunTerminal {
                run_status: status,
            });
        }
        if status != RunStatus::Running {
            return Ok(StepOutcome::Blocked {
                run_status: status,
            });
        }

        let Some(claimed) = self.claim_node(&snapshot, next.run_node_id, next.claim)? else {
            let run_status = self.require_run(run_id)?.status;
            return Ok(StepOutcome::Blocked {
                run_status,
            });
        };

        let outcome = self.execute_claimed_node(run_id, claimed, options)?;

        if let Some(hook) = &options.on_run_terminal {
            let run_status = self.require_run(run_id)?.status;
            if run_status.is_terminal() {
                hook(run_id, run_status);
            }
        }
        Ok(outcome)
    }

    /// Persists pending no-route markers detected by the projection.
    fn persist_no_route_markers(
        &self,
        run_id: RunId,
        projection: &RoutingProjection,
    ) -> Result<(), ExecutorError> {
        for finding in &projection.no_route_pending {
            self.store.insert_routing_decision(&NewRoutingDecision {
                run_id,
                run_node_id: finding.run_node_id,
                decision: DecisionSignal::NoRoute,
                rationale: Some(format!(
                    "no outgoing edge matched decision {}",
                    finding.decision.as_str()
                )),
                attempt: Some(finding.attempt),
                raw_output: None,
            })?;
        }
        Ok(())
    }

    /// Settles a step when nothing is runnable.
    fn resolve_no_runnable(
        &self,
        run_id: RunId,
        snapshot: &GraphSnapshot,
        projection: &RoutingProjection,
    ) -> Result<StepOutcome, ExecutorError> {
        if projection.has_no_route || !projection.unresolved_sources.is_empty() {
            let run_status = self.transition_run_to_current(run_id, RunStatus::Failed)?;
            return Ok(StepOutcome::Blocked {
                run_status,
            });
        }
        let any_live = snapshot
            .nodes
            .iter()
            .any(|node| matches!(node.status, NodeStatus::Pending | NodeStatus::Running));
        if !any_live {
            let any_failed =
                snapshot.nodes.iter().any(|node| node.status == NodeStatus::Failed);
            let desired =
                if any_failed { RunStatus::Failed } else { RunStatus::Completed };
            let run_status = self.transition_run_to_current(run_id, desired)?;
            return Ok(StepOutcome::NoRunnable {
                run_status,
            });
        }
        let run_status = self.transition_run_to_current(run_id, RunStatus::Running)?;
        Ok(StepOutcome::Blocked {
            run_status,
        })
    }

    /// Claims the selected node; `None` means another worker won the race.
    fn claim_node(
        &self,
        snapshot: &GraphSnapshot,
        run_node_id: RunNodeId,
        claim: ClaimKind,
    ) -> Result<Option<RunNode>, ExecutorError> {
        let Some(node) = snapshot.nodes.iter().find(|node| node.id == run_node_id) else {
            return Err(ExecutorError::Internal(format!(
                "selected run node {run_node_id} missing from snapshot"
            )));
        };
        let claimed = match claim {
            ClaimKind::Pending => self.store.transition_node(&NodeTransition {
                run_node_id,
                expected_status: NodeStatus::Pending,
                expected_attempt: node.attempt,
                new_status: NodeStatus::Running,
                increment_attempt: false,
                started_at: TimestampAction::SetNow,
                completed_at: TimestampAction::Keep,
            }),
            ClaimKind::Revisit => self
                .store
                .transition_node(&NodeTransition {
                    run_node_id,
                    expected_status: NodeStatus::Completed,
                    expected_attempt: node.attempt,
                    new_status: NodeStatus::Pending,
                    increment_attempt: true,
                    started_at: TimestampAction::Clear,
                    completed_at: TimestampAction::Clear,
                })
                .and_then(|()| {
                    self.store.transition_node(&NodeTransition {
                        run_node_id,
                        expected_status: NodeStatus::Pending,
                        expected_attempt: node.attempt + 1,
                        new_status: NodeStatus::Running,
                        increment_attempt: false,
                        started_at: TimestampAction::SetNow,
                        completed_at: TimestampAction::Keep,
                    })
                }),
        };
        match claimed {
            Ok(()) => Ok(self.store.load_run_node(run_node_id)?),
            Err(error) if error.is_precondition() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    // ------------------------------------------------------------------
    // Claimed-node execution
    // ------------------------------------------------------------------

    /// Executes a claimed node, retrying in place while eligible. Context is
    /// reassembled fresh on every attempt.
    fn execute_claimed_node(
        &self,
        run_id: RunId,
        mut node: RunNode,
        options: &ExecutionOptions,
    ) -> Result<StepOutcome, ExecutorError> {
        loop {
            let run = self.require_run(run_id)?;
            let snapshot = self.load_snapshot(&run)?;
            let projection = self.project(&snapshot)?;
            let tree_node = snapshot.tree_nodes.get(&node.tree_node_id).ok_or_else(|| {
                ExecutorError::Internal(format!(
                    "tree node {} missing for run node {}",
                    node.tree_node_id, node.id
                ))
            })?;

            let assembly = self.assemble_node_context(run_id, &snapshot, &projection, &node)?;
            let prompt = match tree_node.prompt_template_id {
                Some(template_id) => {
                    self.store.load_prompt_template(template_id)?.map(|template| template.body)
                }
                None => None,
            };
            let template_content_type = match tree_node.prompt_template_id {
                Some(template_id) => self
                    .store
                    .load_prompt_template(template_id)?
                    .and_then(|template| template.content_type)
                    .and_then(|label| ContentType::parse(&label)),
                None => None,
            };
            let permissions = match &tree_node.execution_permissions {
                Some(overrides) => options.base_permissions.merged_with(overrides),
                None => options.base_permissions.clone(),
            };
            let request = PhaseRequest {
                run_id,
                node_key: node.node_key.clone(),
                attempt: node.attempt,
                prompt,
                context_envelopes: assembly.envelopes.clone(),
                permissions,
                model: tree_node.model.clone(),
                working_directory: options.working_directory.clone(),
            };

            let provider_name =
                tree_node.provider.clone().unwrap_or_else(|| options.default_provider.clone());
            let mut sink = StreamSink::new(&self.store, &self.clock, run_id, node.id, node.attempt);
            let phase_result = match self.resolver.resolve(&provider_name) {
                Ok(provider) => provider.run_phase(&request, &mut |event| sink.push(&event)),
                Err(error) => Err(error),
            };
            let StreamSink {
                usage,
                sanitized,
                redacted,
                first_error,
                ..
            } = sink;
            if let Some(error) = first_error {
                return Err(error.into());
            }

            match phase_result {
                Ok(output) => {
                    return self.complete_node(
                        run_id,
                        &node,
                        tree_node,
                        template_content_type,
                        &output,
                        &assembly,
                        &sanitized,
                        redacted,
                        usage.cumulative(),
                    );
                }
                Err(error) => {
                    match self.handle_failure(
                        run_id,
                        &node,
                        tree_node,
                        &error,
                        &assembly,
                        &sanitized,
                        redacted,
                    )? {
                        FailureNext::RetryImmediate(refreshed) => {
                            node = refreshed;
                        }
                        FailureNext::Settled(outcome) => return Ok(outcome),
                    }
                }
            }
        }
    }

    /// Collects direct-predecessor report artifacts and assembles envelopes.
    fn assemble_node_context(
        &self,
        run_id: RunId,
        snapshot: &GraphSnapshot,
        projection: &RoutingProjection,
        node: &RunNode,
    ) -> Result<ContextAssembly, ExecutorError> {
        let mut sources: Vec<&RunNode> = Vec::new();
        if let Some(incoming) = projection.incoming_edges_by_target.get(&node.tree_node_id) {
            for edge_id in incoming {
                let Some(edge) = snapshot.edges.iter().find(|edge| edge.id == *edge_id) else {
                    continue;
                };
                if projection.selected_edge_by_source.get(&edge.source_node_id) != Some(edge_id) {
                    continue;
                }
                let Some(source) = snapshot.node_for_tree_node(edge.source_node_id) else {
                    continue;
                };
                if source.status == NodeStatus::Completed {
                    sources.push(source);
                }
            }
        }
        sources.sort_by(|left, right| {
            left.sequence_index
                .cmp(&right.sequence_index)
                .then_with(|| left.node_key.as_bytes().cmp(right.node_key.as_bytes()))
                .then_with(|| left.id.cmp(&right.id))
        });
        sources.dedup_by_key(|source| source.id);

        let artifacts = self.store.load_artifacts(run_id)?;
        let mut candidates = Vec::new();
        let mut saw_non_report_only = false;
        for source in sources {
            let latest_report = artifacts
                .iter()
                .filter(|artifact| {
                    artifact.run_node_id == source.id
                        && artifact.artifact_type == ArtifactType::Report
                })
                .max_by_key(|artifact| artifact.id);
            match latest_report {
                Some(artifact) => candidates.push(ContextCandidate {
                    source_node_key: source.node_key.clone(),
                    source_run_node_id: source.id,
                    source_attempt: source.attempt,
                    artifact: artifact.clone(),
                }),
                None => {
                    if artifacts.iter().any(|artifact| artifact.run_node_id == source.id) {
                        saw_non_report_only = true;
                    }
                }
            }
        }
        let no_eligible = candidates.is_empty() && saw_non_report_only;
        Ok(assemble_context(run_id, &node.node_key, &candidates, no_eligible, self.clock.now()))
    }

    /// Success path: artifact, routing decision, reactivation, transitions,
    /// diagnostics, pruning, and run-status recomputation.
    #[allow(
        clippy::too_many_arguments,
        reason = "The success path threads the full attempt context once."
    )]
    fn complete_node(
        &self,
        run_id: RunId,
        node: &RunNode,
        tree_node: &TreeNode,
        template_content_type: Option<ContentType>,
        output: &PhaseOutput,
        assembly: &ContextAssembly,
        events: &[SanitizedEvent],
        redacted: bool,
        cumulative_tokens: Option<u64>,
    ) -> Result<StepOutcome, ExecutorError> {
        let manifest = serde_json::to_value(&assembly.manifest)
            .map_err(|err| ExecutorError::Internal(err.to_string()))?;
        self.store.insert_artifact(&NewArtifact {
            run_id,
            run_node_id: node.id,
            artifact_type: ArtifactType::Report,
            content_type: template_content_type.unwrap_or(ContentType::Markdown),
            content: output.report.clone(),
            metadata: json!({
                "tokens": cumulative_tokens.or(output.tokens_used),
                "event_count": events.len(),
                "context_manifest": manifest,
            }),
        })?;

        let snapshot = self.load_snapshot(&self.require_run(run_id)?)?;
        let outgoing = ordered_success_edges(&snapshot.edges, tree_node.id);
        let selected = match_outgoing_edge(&outgoing, output.routing_decision, &snapshot.guards)?;
        if let Some(signal) = output.routing_decision {
            let nodes_by_tree_node: BTreeMap<TreeNodeId, &RunNode> =
                snapshot.nodes.iter().map(|row| (row.tree_node_id, row)).collect();
            let dead_end =
                selected.is_none() && has_live_successor(&outgoing, &nodes_by_tree_node);
            let decision = if dead_end { DecisionSignal::NoRoute } else { signal };
            let rationale = if decision == DecisionSignal::NoRoute {
                Some(format!("no outgoing edge matched decision {}", signal.as_str()))
            } else {
                output.rationale.clone()
            };
            self.store.insert_routing_decision(&NewRoutingDecision {
                run_id,
                run_node_id: node.id,
                decision,
                rationale,
                attempt: Some(node.attempt),
                raw_output: output.metadata.clone(),
            })?;
        }

        if let Some(edge_id) = selected {
            self.reactivate_target(&snapshot, edge_id)?;
        }

        self.store.transition_node(&NodeTransition {
            run_node_id: node.id,
            expected_status: NodeStatus::Running,
            expected_attempt: node.attempt,
            new_status: NodeStatus::Completed,
            increment_attempt: false,
            started_at: TimestampAction::Keep,
            completed_at: TimestampAction::SetNow,
        })?;

        self.persist_diagnostics(run_id, node, "completed", "completed", None, events, redacted)?;
        self.prune_unreachable(run_id)?;
        let run_status = self.recompute_run_status(run_id)?;
        Ok(StepOutcome::Executed {
            run_node_id: node.id,
            node_key: node.node_key.clone(),
            attempt: node.attempt,
            node_status: NodeStatus::Completed,
            run_status,
        })
    }

    /// Reactivates the selected edge's target: skipped nodes return to
    /// pending, completed nodes revisit with a fresh attempt.
    fn reactivate_target(
        &self,
        snapshot: &GraphSnapshot,
        edge_id: EdgeId,
    ) -> Result<(), ExecutorError> {
        let Some(edge) = snapshot.edges.iter().find(|edge| edge.id == edge_id) else {
            return Ok(());
        };
        let Some(target) = snapshot.node_for_tree_node(edge.target_node_id) else {
            return Ok(());
        };
        let transition = match target.status {
            NodeStatus::Skipped => NodeTransition {
                run_node_id: target.id,
                expected_status: NodeStatus::Skipped,
                expected_attempt: target.attempt,
                new_status: NodeStatus::Pending,
                increment_attempt: false,
                started_at: TimestampAction::Clear,
                completed_at: TimestampAction::Clear,
            },
            NodeStatus::Completed => NodeTransition {
                run_node_id: target.id,
                expected_status: NodeStatus::Completed,
                expected_attempt: target.attempt,
                new_status: NodeStatus::Pending,
                increment_attempt: true,
                started_at: TimestampAction::Clear,
                completed_at: TimestampAction::Clear,
            },
            NodeStatus::Pending
            | NodeStatus::Running
            | NodeStatus::Failed
            | NodeStatus::Cancelled => return Ok(()),
        };
        match self.store.transition_node(&transition) {
            Ok(()) => Ok(()),
            // Another worker already reactivated (or claimed) the target.
            Err(error) if error.is_precondition() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Failure path: failure artifact, retry decision, diagnostics, and run
    /// failure when retries are exhausted.
    fn handle_failure(
        &self,
        run_id: RunId,
        node: &RunNode,
        tree_node: &TreeNode,
        error: &ProviderError,
        assembly: &ContextAssembly,
        events: &[SanitizedEvent],
        redacted: bool,
    ) -> Result<FailureNext, ExecutorError> {
        let node_now = self
            .store
            .load_run_node(node.id)?
            .ok_or_else(|| ExecutorError::Internal(format!("run node {} vanished", node.id)))?;
        let run_now = self.require_run(run_id)?;
        let attempt = node.attempt;
        let max_retries = tree_node.max_retries;
        let retries_remaining = (max_retries + 1 - attempt).max(0);
        let failure_reason = error.to_string();
        let error_name = error.error_name().to_string();

        let manifest = serde_json::to_value(&assembly.manifest)
            .map_err(|err| ExecutorError::Internal(err.to_string()))?;
        self.store.insert_artifact(&NewArtifact {
            run_id,
            run_node_id: node.id,
            artifact_type: ArtifactType::Log,
            content_type: ContentType::Text,
            content: format!(
                "node {} attempt {attempt} failed: {failure_reason}",
                node.node_key
            ),
            metadata: json!({
                "attempt": attempt,
                "max_retries": max_retries,
                "retries_remaining": retries_remaining,
                "error_name": error_name,
                "failure_reason": failure_reason,
                "node_status_at_failure": node_now.status.as_str(),
                "context_manifest": manifest,
            }),
        })?;

        let attempt_error = Some(AttemptError {
            name: error_name,
            message: failure_reason,
            stack_preview: match error {
                ProviderError::Phase {
                    stack: Some(stack), ..
                } => Some(stack_preview(stack)),
                ProviderError::Phase {
                    stack: None, ..
                }
                | ProviderError::UnknownProvider(_) => None,
            },
        });

        // A node that reported completion but still threw is recorded and
        // never retried.
        if node_now.status == NodeStatus::Completed {
            self.persist_diagnostics(
                run_id,
                node,
                "post_completion_failure",
                node_now.status.as_str(),
                attempt_error,
                events,
                redacted,
            )?;
            let run_status = self.recompute_run_status(run_id)?;
            return Ok(FailureNext::Settled(StepOutcome::Executed {
                run_node_id: node.id,
                node_key: node.node_key.clone(),
                attempt,
                node_status: node_now.status,
                run_status,
            }));
        }

        let retry_eligible = attempt <= max_retries;

        if retry_eligible
            && node_now.status == NodeStatus::Running
            && run_now.status == RunStatus::Running
        {
            let retried = self.store.transition_node(&NodeTransition {
                run_node_id: node.id,
                expected_status: NodeStatus::Running,
                expected_attempt: attempt,
                new_status: NodeStatus::Running,
                increment_attempt: true,
                started_at: TimestampAction::SetNow,
                completed_at: TimestampAction::Clear,
            });
            match retried {
                Ok(()) => {
                    self.persist_diagnostics(
                        run_id,
                        node,
                        "retrying",
                        NodeStatus::Running.as_str(),
                        attempt_error,
                        events,
                        redacted,
                    )?;
                    let refreshed = self.store.load_run_node(node.id)?.ok_or_else(|| {
                        ExecutorError::Internal(format!("run node {} vanished", node.id))
                    })?;
                    return Ok(FailureNext::RetryImmediate(refreshed));
                }
                Err(error) if error.is_precondition() => {
                    let run_status = self.require_run(run_id)?.status;
                    return Ok(FailureNext::Settled(StepOutcome::Blocked {
                        run_status,
                    }));
                }
                Err(error) => return Err(error.into()),
            }
        }

        if retry_eligible
            && node_now.status == NodeStatus::Running
            && run_now.status == RunStatus::Paused
        {
            // Deferred retry: requeue the node; the next step after resume
            // picks it up with a fresh attempt.
            self.store.transition_node(&NodeTransition {
                run_node_id: node.id,
                expected_status: NodeStatus::Running,
                expected_attempt: attempt,
                new_status: NodeStatus::Failed,
                increment_attempt: false,
                started_at: TimestampAction::Keep,
                completed_at: TimestampAction::SetNow,
            })?;
            self.store.transition_node(&NodeTransition {
                run_node_id: node.id,
                expected_status: NodeStatus::Failed,
                expected_attempt: attempt,
                new_status: NodeStatus::Pending,
                increment_attempt: true,
                started_at: TimestampAction::Clear,
                completed_at: TimestampAction::Clear,
            })?;
            self.persist_diagnostics(
                run_id,
                node,
                "deferred_retry",
                NodeStatus::Pending.as_str(),
                attempt_error,
                events,
                redacted,
            )?;
            return Ok(FailureNext::Settled(StepOutcome::Executed {
                run_node_id: node.id,
                node_key: node.node_key.clone(),
                attempt,
                node_status: NodeStatus::Pending,
                run_status: run_now.status,
            }));
        }

        // Retries exhausted (or the state raced away from us): settle the
        // node as failed and fail the run.
        if node_now.status == NodeStatus::Running {
            let settled = self.store.transition_node(&NodeTransition {
                run_node_id: node.id,
                expected_status: NodeStatus::Running,
                expected_attempt: attempt,
                new_status: NodeStatus::Failed,
                increment_attempt: false,
                started_at: TimestampAction::Keep,
                completed_at: TimestampAction::SetNow,
            });
            if let Err(error) = settled
                && !error.is_precondition()
            {
                return Err(error.into());
            }
        }
        self.persist_diagnostics(
            run_id,
            node,
            "failed",
            NodeStatus::Failed.as_str(),
            attempt_error,
            events,
            redacted,
        )?;
        let run_status = self.transition_run_to_current(run_id, RunStatus::Failed)?;
        Ok(FailureNext::Settled(StepOutcome::Executed {
            run_node_id: node.id,
            node_key: node.node_key.clone(),
            attempt,
            node_status: NodeStatus::Failed,
            run_status,
        }))
    }

    /// Builds and persists the attempt diagnostics payload (idempotent per
    /// attempt).
    fn persist_diagnostics(
        &self,
        run_id: RunId,
        node: &RunNode,
        outcome: &str,
        status: &str,
        error: Option<AttemptError>,
        events: &[SanitizedEvent],
        redacted: bool,
    ) -> Result<(), ExecutorError> {
        let built = build_attempt_diagnostics(outcome, status, error, events, redacted);
        self.store.insert_diagnostics(&NewDiagnostics {
            run_id,
            run_node_id: node.id,
            attempt: node.attempt,
            outcome: outcome.to_string(),
            counts: built.counts,
            redacted: built.payload.redacted,
            truncated: built.payload.truncated,
            payload_chars: i64::try_from(built.payload_chars).unwrap_or(i64::MAX),
            diagnostics: built.rendered,
        })?;
        Ok(())
    }

    /// Marks unreachable pending nodes as skipped until a fixed point.
    fn prune_unreachable(&self, run_id: RunId) -> Result<(), ExecutorError> {
        let run = self.require_run(run_id)?;
        let snapshot = self.load_snapshot(&run)?;
        let projection = self.project(&snapshot)?;
        let unreachable = compute_unreachable_pending(&snapshot.nodes, &snapshot.edges, &projection);
        for run_node_id in unreachable {
            let Some(node) = snapshot.nodes.iter().find(|node| node.id == run_node_id) else {
                continue;
            };
            let skipped = self.store.transition_node(&NodeTransition {
                run_node_id,
                expected_status: NodeStatus::Pending,
                expected_attempt: node.attempt,
                new_status: NodeStatus::Skipped,
                increment_attempt: false,
                started_at: TimestampAction::Keep,
                completed_at: TimestampAction::Keep,
            });
            if let Err(error) = skipped
                && !error.is_precondition()
            {
                return Err(error.into());
            }
        }
        Ok(())
    }

    /// Recomputes the run status from latest-attempt node statuses.
    fn recompute_run_status(&self, run_id: RunId) -> Result<RunStatus, ExecutorError> {
        let nodes = latest_run_node_attempts(&self.store.load_run_nodes(run_id)?);
        let any_failed = nodes.iter().any(|node| node.status == NodeStatus::Failed);
        let any_live = nodes
            .iter()
            .any(|node| matches!(node.status, NodeStatus::Pending | NodeStatus::Running));
        let desired = if any_failed {
            RunStatus::Failed
        } else if any_live {
            RunStatus::Running
        } else {
            RunStatus::Completed
        };
        self.transition_run_to_current(run_id, desired)
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Steps the run until a non-executed outcome, a terminal status, or the
    /// step ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError`] when a step fails.
    pub fn execute_run(
        &self,
        run_id: RunId,
        options: &ExecutionOptions,
        max_steps: u64,
    ) -> Result<RunResult, ExecutorError> {
        let mut executed_nodes = 0_u64;
        for _ in 0 .. max_steps {
            let step = self.execute_next_runnable_node(run_id, options)?;
            match &step {
                StepOutcome::Executed {
                    ..
                } => {
                    executed_nodes += 1;
                }
                StepOutcome::RunTerminal {
                    ..
                }
                | StepOutcome::Blocked {
                    ..
                }
                | StepOutcome::NoRunnable {
                    ..
                } => {
                    return Ok(RunResult {
                        executed_nodes,
                        final_step: step,
                    });
                }
            }
        }
        let final_step = self.fail_run_on_iteration_limit(run_id, max_steps)?;
        Ok(RunResult {
            executed_nodes,
            final_step,
        })
    }

    /// Fails a run that exhausted its step ceiling, attaching an explanatory
    /// artifact and diagnostics to the most relevant node.
    fn fail_run_on_iteration_limit(
        &self,
        run_id: RunId,
        max_steps: u64,
    ) -> Result<StepOutcome, ExecutorError> {
        let run = self.require_run(run_id)?;
        if run.status.is_terminal() {
            return Ok(StepOutcome::RunTerminal {
                run_status: run.status,
            });
        }
        let snapshot = self.load_snapshot(&run)?;
        let projection = self.project(&snapshot)?;
        let next =
            find_next_runnable(&snapshot.nodes, &snapshot.edges, &projection, &snapshot.latest_artifacts);
        let target = next
            .and_then(|next| snapshot.nodes.iter().find(|node| node.id == next.run_node_id))
            .or_else(|| snapshot.nodes.iter().find(|node| node.status == NodeStatus::Running))
            .or_else(|| snapshot.nodes.last());

        if let Some(node) = target {
            self.store.insert_artifact(&NewArtifact {
                run_id,
                run_node_id: node.id,
                artifact_type: ArtifactType::Log,
                content_type: ContentType::Text,
                content: format!(
                    "run {run_id} exceeded the execution step limit of {max_steps}"
                ),
                metadata: json!({
                    "error_name": "iteration_limit_exceeded",
                    "max_steps": max_steps,
                    "node_key": node.node_key,
                    "attempt": node.attempt,
                }),
            })?;
            if node.status == NodeStatus::Running {
                let settled = self.store.transition_node(&NodeTransition {
                    run_node_id: node.id,
                    expected_status: NodeStatus::Running,
                    expected_attempt: node.attempt,
                    new_status: NodeStatus::Failed,
                    increment_attempt: false,
                    started_at: TimestampAction::Keep,
                    completed_at: TimestampAction::SetNow,
                });
                if let Err(error) = settled
                    && !error.is_precondition()
                {
                    return Err(error.into());
                }
            }
            self.persist_diagnostics(
                run_id,
                node,
                "failed",
                node.status.as_str(),
                Some(AttemptError {
                    name: "iteration_limit_exceeded".to_string(),
                    message: format!("execution exceeded {max_steps} steps"),
                    stack_preview: None,
                }),
                &[],
                false,
            )?;
        }
        let run_status = self.transition_run_to_current(run_id, RunStatus::Failed)?;
        Ok(StepOutcome::RunTerminal {
            run_status,
        })
    }
}
