// crates/alphred-core/src/interfaces/mod.rs
// ============================================================================
// Module: Alphred Interfaces
// Description: Backend-agnostic contracts for storage and agent providers.
// Purpose: Define the seams the executor drives without embedding backends.
// Dependencies: crate::core, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! The executor only touches the database through [`WorkflowStore`] and only
//! reaches agents through [`ProviderResolver`]. Store implementations must
//! enforce row-level optimistic concurrency: every status/attempt mutation is
//! guarded by the caller-supplied expected values and a row-count miss is a
//! [`StoreError::Precondition`], never a silent overwrite.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::ArtifactId;
use crate::core::ArtifactType;
use crate::core::ContentType;
use crate::core::DecisionId;
use crate::core::DecisionSignal;
use crate::core::ExecutionPermissions;
use crate::core::GuardDefinition;
use crate::core::GuardExpression;
use crate::core::GuardId;
use crate::core::NodeRole;
use crate::core::NodeStatus;
use crate::core::NodeType;
use crate::core::PhaseArtifact;
use crate::core::PromptTemplate;
use crate::core::PromptTemplateId;
use crate::core::RouteOn;
use crate::core::RoutingDecision;
use crate::core::RunId;
use crate::core::RunNode;
use crate::core::RunNodeDiagnostics;
use crate::core::RunNodeId;
use crate::core::RunNodeStreamEvent;
use crate::core::RunStatus;
use crate::core::RunWorktree;
use crate::core::Timestamp;
use crate::core::TreeEdge;
use crate::core::TreeId;
use crate::core::TreeNode;
use crate::core::TreeNodeId;
use crate::core::WorkflowRun;
use crate::core::WorkflowTree;
use crate::core::WorktreeId;

// ============================================================================
// SECTION: Store Errors
// ============================================================================

/// Workflow store errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
/// - `Precondition` is raised exactly when a guarded update changed a
///   row-count other than 1.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store I/O error.
    #[error("workflow store io error: {0}")]
    Io(String),
    /// Database engine error.
    #[error("workflow store db error: {0}")]
    Db(String),
    /// Stored data is invalid or fails shape checks.
    #[error("workflow store invalid data: {0}")]
    Invalid(String),
    /// Referenced row does not exist.
    #[error("workflow store row not found: {0}")]
    NotFound(String),
    /// Unique-key or revision race detected.
    #[error("workflow store conflict: {0}")]
    Conflict(String),
    /// Guarded update missed its expected status/attempt row.
    #[error("workflow store precondition failed: {entity}: {detail}")]
    Precondition {
        /// Entity class the guarded update targeted.
        entity: String,
        /// Expected-versus-observed description.
        detail: String,
    },
}

impl StoreError {
    /// Returns true for optimistic-concurrency misses that callers may retry.
    #[must_use]
    pub const fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition { .. })
    }
}

// ============================================================================
// SECTION: Insert Payloads
// ============================================================================

/// New run-node row created by the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRunNode {
    /// Tree node this row instantiates.
    pub tree_node_id: TreeNodeId,
    /// Stable node key copied from the tree node.
    pub node_key: String,
    /// Deterministic ordering index copied from the tree node.
    pub sequence_index: i64,
}

/// New phase artifact row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewArtifact {
    /// Owning run identifier.
    pub run_id: RunId,
    /// Producing run-node identifier.
    pub run_node_id: RunNodeId,
    /// Artifact kind.
    pub artifact_type: ArtifactType,
    /// Body content type.
    pub content_type: ContentType,
    /// Full artifact body.
    pub content: String,
    /// Dynamic metadata blob.
    pub metadata: Value,
}

/// New routing decision row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRoutingDecision {
    /// Owning run identifier.
    pub run_id: RunId,
    /// Deciding run-node identifier.
    pub run_node_id: RunNodeId,
    /// Decision signal.
    pub decision: DecisionSignal,
    /// Optional free-form rationale.
    pub rationale: Option<String>,
    /// Attempt the decision is recorded for.
    pub attempt: Option<i64>,
    /// Raw provider output retained for audit.
    pub raw_output: Option<Value>,
}

/// New diagnostics row for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDiagnostics {
    /// Owning run identifier.
    pub run_id: RunId,
    /// Diagnosed run-node identifier.
    pub run_node_id: RunNodeId,
    /// Attempt the payload describes.
    pub attempt: i64,
    /// Attempt outcome label.
    pub outcome: String,
    /// Event-type histogram over the full stream.
    pub counts: Value,
    /// True when any redaction fired.
    pub redacted: bool,
    /// True when events or previews were dropped to fit caps.
    pub truncated: bool,
    /// Serialized payload length in characters.
    pub payload_chars: i64,
    /// Full diagnostics payload (schema version 1).
    pub diagnostics: Value,
}

/// New stream event row (sequence assigned by the store).
#[derive(Debug, Clone, PartialEq)]
pub struct NewStreamEvent {
    /// Provider event type label.
    pub event_type: String,
    /// Event arrival time.
    pub timestamp: Timestamp,
    /// Character count of the full event content.
    pub content_chars: i64,
    /// Head-tail preview of the event content (redacted).
    pub content_preview: Option<String>,
    /// Sanitized metadata blob.
    pub metadata: Option<Value>,
    /// Tokens attributed to this event.
    pub usage_delta_tokens: Option<i64>,
    /// Running token total after this event.
    pub usage_cumulative_tokens: Option<i64>,
}

/// Latest artifact projection entry for one run node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatestArtifact {
    /// Run node that produced the artifact.
    pub run_node_id: RunNodeId,
    /// Latest artifact id (insertion-ordered maximum).
    pub artifact_id: ArtifactId,
    /// Creation time of that artifact.
    pub created_at: Timestamp,
}

// ============================================================================
// SECTION: Guarded Transitions
// ============================================================================

/// Timestamp adjustment requested alongside a guarded node update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampAction {
    /// Leave the column untouched.
    Keep,
    /// Stamp the column with the store's current time.
    SetNow,
    /// Clear the column to NULL.
    Clear,
}

/// Guarded run-node status/attempt update.
///
/// # Invariants
/// - The update applies only to the row matching `run_node_id` with exactly
///   `expected_status` and `expected_attempt`; otherwise the store raises
///   [`StoreError::Precondition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTransition {
    /// Target run-node identifier.
    pub run_node_id: RunNodeId,
    /// Status the row must currently hold.
    pub expected_status: NodeStatus,
    /// Attempt the row must currently hold.
    pub expected_attempt: i64,
    /// Status to write.
    pub new_status: NodeStatus,
    /// True when the attempt counter increments in the same update.
    pub increment_attempt: bool,
    /// Adjustment for `started_at`.
    pub started_at: TimestampAction,
    /// Adjustment for `completed_at`.
    pub completed_at: TimestampAction,
}

// ============================================================================
// SECTION: Tree Definitions
// ============================================================================

/// New tree node within a draft definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTreeNode {
    /// Stable key unique within the tree.
    pub node_key: String,
    /// Kind of work this node performs.
    pub node_type: NodeType,
    /// Structural role in the graph.
    pub node_role: NodeRole,
    /// Provider name for agent nodes.
    pub provider: Option<String>,
    /// Model override for agent nodes.
    pub model: Option<String>,
    /// Node-level execution permission overrides.
    pub execution_permissions: Option<ExecutionPermissions>,
    /// Index into the definition's template list.
    pub template_index: Option<usize>,
    /// Maximum retries after the first attempt (>= 0).
    pub max_retries: i64,
    /// Deterministic ordering index within the tree.
    pub sequence_index: i64,
}

/// New guarded edge within a draft definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTreeEdge {
    /// Source node key.
    pub source_node_key: String,
    /// Target node key.
    pub target_node_key: String,
    /// Scan priority (lower scans first, >= 0).
    pub priority: i64,
    /// True when the edge matches without a routing decision.
    pub auto: bool,
    /// Index into the definition's guard list.
    pub guard_index: Option<usize>,
    /// Outcome lane this edge routes on.
    pub route_on: RouteOn,
}

/// New prompt template within a draft definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPromptTemplate {
    /// Template name.
    pub name: String,
    /// Content type reports inherit.
    pub content_type: Option<String>,
    /// Template body handed to the provider.
    pub body: String,
}

/// Complete draft content replacing a tree's nodes, edges, guards, and
/// templates in one accepted save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeDefinition {
    /// Node definitions.
    pub nodes: Vec<NewTreeNode>,
    /// Edge definitions (node references by key, guard references by index).
    pub edges: Vec<NewTreeEdge>,
    /// Guard expressions referenced by edges.
    pub guards: Vec<GuardExpression>,
    /// Prompt templates referenced by nodes.
    pub templates: Vec<NewPromptTemplate>,
}

// ============================================================================
// SECTION: Workflow Store
// ============================================================================

/// Durable workflow store driven by the planner, executor, and controls.
///
/// # Invariants
/// - Every mutation refreshes the row's `updated_at`.
/// - Terminal run transitions stamp `completed_at`; node revisits clear both
///   node timestamps.
/// - Stream event sequences are gap-free per `(run_node_id, attempt)`.
pub trait WorkflowStore {
    /// Loads a workflow tree by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn load_tree(&self, tree_id: TreeId) -> Result<Option<WorkflowTree>, StoreError>;

    /// Finds the latest published version of a tree key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn find_latest_published_tree(
        &self,
        tree_key: &str,
    ) -> Result<Option<WorkflowTree>, StoreError>;

    /// Loads all nodes of a tree ordered by `(sequence_index, node_key, id)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn load_tree_nodes(&self, tree_id: TreeId) -> Result<Vec<TreeNode>, StoreError>;

    /// Loads all edges of a tree ordered by `(priority, target_node_id, id)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn load_tree_edges(&self, tree_id: TreeId) -> Result<Vec<TreeEdge>, StoreError>;

    /// Loads a guard definition by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading or expression parsing fails.
    fn load_guard(&self, guard_id: GuardId) -> Result<Option<GuardDefinition>, StoreError>;

    /// Loads a prompt template by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn load_prompt_template(
        &self,
        template_id: PromptTemplateId,
    ) -> Result<Option<PromptTemplate>, StoreError>;

    /// Bootstraps a new draft tree for a key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when a concurrent bootstrap won the
    /// unique-version race.
    fn create_draft_tree(&self, tree_key: &str, name: &str) -> Result<WorkflowTree, StoreError>;

    /// Replaces a draft's content and bumps `draft_revision` by exactly 1.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when `expected_revision` does not
    /// match the stored revision, [`StoreError::Invalid`] on malformed
    /// definitions.
    fn save_draft_tree(
        &self,
        tree_id: TreeId,
        expected_revision: i64,
        definition: &TreeDefinition,
    ) -> Result<i64, StoreError>;

    /// Publishes a draft: assigns the next version for the key, flips status
    /// to published, and resets `draft_revision` to 0.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] on revision mismatch.
    fn publish_draft_tree(&self, tree_id: TreeId, expected_revision: i64)
    -> Result<i64, StoreError>;

    /// Loads a run by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn load_run(&self, run_id: RunId) -> Result<Option<WorkflowRun>, StoreError>;

    /// Lists all runs ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn list_runs(&self) -> Result<Vec<WorkflowRun>, StoreError>;

    /// Creates a pending run plus its pending run-nodes in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when any insert fails (nothing is committed).
    fn create_run_with_nodes(
        &self,
        tree_id: TreeId,
        nodes: &[NewRunNode],
    ) -> Result<RunId, StoreError>;

    /// Applies a guarded run status transition.
    ///
    /// The store stamps `started_at` on the first entry into `running` and
    /// `completed_at` on terminal targets.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Precondition`] when the run is not in
    /// `expected_status`.
    fn transition_run(
        &self,
        run_id: RunId,
        expected_status: RunStatus,
        new_status: RunStatus,
    ) -> Result<(), StoreError>;

    /// Loads all run-node rows of a run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn load_run_nodes(&self, run_id: RunId) -> Result<Vec<RunNode>, StoreError>;

    /// Loads one run-node row by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn load_run_node(&self, run_node_id: RunNodeId) -> Result<Option<RunNode>, StoreError>;

    /// Applies a guarded node status/attempt update.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Precondition`] when the row does not match the
    /// expected status and attempt.
    fn transition_node(&self, transition: &NodeTransition) -> Result<(), StoreError>;

    /// Requeues every latest-attempt failed node (`failed -> pending`,
    /// attempt + 1, timestamps cleared) and moves the run `failed -> running`,
    /// all in one transaction. Returns the requeued node ids; an empty result
    /// means nothing was requeued and the run was left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Precondition`] when the run is not `failed`.
    fn requeue_failed_nodes(&self, run_id: RunId) -> Result<Vec<RunNodeId>, StoreError>;

    /// Inserts a phase artifact.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the insert fails.
    fn insert_artifact(&self, artifact: &NewArtifact) -> Result<ArtifactId, StoreError>;

    /// Loads all artifacts of a run ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn load_artifacts(&self, run_id: RunId) -> Result<Vec<PhaseArtifact>, StoreError>;

    /// Returns the latest artifact per run-node (insertion-ordered maximum).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn latest_artifacts_by_run_node(
        &self,
        run_id: RunId,
    ) -> Result<Vec<LatestArtifact>, StoreError>;

    /// Inserts a routing decision.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the insert fails.
    fn insert_routing_decision(
        &self,
        decision: &NewRoutingDecision,
    ) -> Result<DecisionId, StoreError>;

    /// Returns the latest routing decision per run-node, ordered by
    /// `(created_at, id)` recency.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn latest_routing_decisions(&self, run_id: RunId) -> Result<Vec<RoutingDecision>, StoreError>;

    /// Inserts an attempt diagnostics row; a duplicate
    /// `(run_id, run_node_id, attempt)` is a no-op returning `false`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the insert fails for any other reason.
    fn insert_diagnostics(&self, diagnostics: &NewDiagnostics) -> Result<bool, StoreError>;

    /// Loads diagnostics rows for one run-node ordered by attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn load_diagnostics(
        &self,
        run_id: RunId,
        run_node_id: RunNodeId,
    ) -> Result<Vec<RunNodeDiagnostics>, StoreError>;

    /// Appends stream events with sequences continuing from the current
    /// maximum; returns the first assigned sequence.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the insert fails.
    fn append_stream_events(
        &self,
        run_id: RunId,
        run_node_id: RunNodeId,
        attempt: i64,
        events: &[NewStreamEvent],
    ) -> Result<i64, StoreError>;

    /// Reads stream events with `sequence > cursor` in sequence order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn stream_events_after(
        &self,
        run_node_id: RunNodeId,
        attempt: i64,
        cursor: i64,
    ) -> Result<Vec<RunNodeStreamEvent>, StoreError>;

    /// Registers a worktree row for a run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the insert fails.
    fn insert_worktree(
        &self,
        run_id: RunId,
        path: &str,
        status: &str,
    ) -> Result<WorktreeId, StoreError>;

    /// Returns the latest `active` worktree row for a run, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn latest_active_worktree(&self, run_id: RunId) -> Result<Option<RunWorktree>, StoreError>;

    /// Reports store readiness for liveness/readiness probes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store is unavailable.
    fn readiness(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ============================================================================
// SECTION: Store Sessions
// ============================================================================

/// Factory opening independent store sessions.
///
/// Background tasks must not share the launching request's session; each task
/// opens its own through this seam.
pub trait StoreSessionFactory: Send + Sync {
    /// Store type produced by this factory.
    type Store: WorkflowStore + Send + Sync;

    /// Opens a fresh store session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the session cannot be opened.
    fn open_session(&self) -> Result<Self::Store, StoreError>;
}

// ============================================================================
// SECTION: Agent Providers
// ============================================================================

/// Provider errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// No provider is registered under the requested name.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    /// Provider reported a phase failure.
    #[error("provider phase error: {name}: {message}")]
    Phase {
        /// Stable error name for failure artifacts and diagnostics.
        name: String,
        /// Human-readable failure reason.
        message: String,
        /// Optional stack rendering for diagnostics previews.
        stack: Option<String>,
    },
}

impl ProviderError {
    /// Returns the stable error name used in failure artifacts.
    #[must_use]
    pub fn error_name(&self) -> &str {
        match self {
            Self::UnknownProvider(_) => "unknown_provider",
            Self::Phase {
                name, ..
            } => name,
        }
    }
}

/// Streaming event emitted by a provider during a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEvent {
    /// Provider event type label (`message`, `tool_use`, `error`, ...).
    pub event_type: String,
    /// Optional event content.
    pub content: Option<String>,
    /// Optional dynamic metadata.
    pub metadata: Option<Value>,
    /// Optional incremental token count for this event.
    pub tokens: Option<u64>,
}

/// Phase invocation assembled by the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseRequest {
    /// Run being advanced.
    pub run_id: RunId,
    /// Node key being executed.
    pub node_key: String,
    /// Attempt number of this invocation.
    pub attempt: i64,
    /// Prompt template body, when the node has one.
    pub prompt: Option<String>,
    /// Upstream-artifact envelopes appended to the provider context.
    pub context_envelopes: Vec<String>,
    /// Merged execution permissions (run base overlaid with node overrides).
    pub permissions: ExecutionPermissions,
    /// Model override from the node, if set.
    pub model: Option<String>,
    /// Working directory resolved for the run.
    pub working_directory: Option<String>,
}

/// Final result of a successful phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutput {
    /// Report body persisted as the success artifact.
    pub report: String,
    /// Structured routing decision from the result metadata (authoritative;
    /// no fallback parsing of the report text).
    pub routing_decision: Option<DecisionSignal>,
    /// Optional decision rationale.
    pub rationale: Option<String>,
    /// Total tokens the provider attributed to the phase.
    pub tokens_used: Option<u64>,
    /// Raw result metadata retained for audit.
    pub metadata: Option<Value>,
}

/// Agent provider executing one phase with streaming events.
pub trait AgentProvider: Send + Sync {
    /// Runs a phase, delivering each streaming event to `on_event` as it
    /// arrives.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the phase fails.
    fn run_phase(
        &self,
        request: &PhaseRequest,
        on_event: &mut dyn FnMut(ProviderEvent),
    ) -> Result<PhaseOutput, ProviderError>;
}

/// Resolver mapping provider names to implementations.
pub trait ProviderResolver: Send + Sync {
    /// Resolves a provider by name.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnknownProvider`] when the name is not
    /// registered.
    fn resolve(&self, provider: &str) -> Result<Arc<dyn AgentProvider>, ProviderError>;
}

impl<T: ProviderResolver + ?Sized> ProviderResolver for Arc<T> {
    fn resolve(&self, provider: &str) -> Result<Arc<dyn AgentProvider>, ProviderError> {
        (**self).resolve(provider)
    }
}
