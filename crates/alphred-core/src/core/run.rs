// crates/alphred-core/src/core/run.rs
// ============================================================================
// Module: Alphred Run Model
// Description: Runtime records: runs, run nodes, artifacts, decisions, events.
// Purpose: Capture the durable execution history of a materialized workflow.
// Dependencies: crate::core::{identifiers, status, time}, serde, serde_json
// ============================================================================

//! ## Overview
//! A workflow run owns one run-node row per tree node, updated in place
//! across retries and loop revisits with a monotonically increasing attempt
//! counter. Artifacts, routing decisions, diagnostics, and stream events hang
//! off run nodes and are never mutated after insert.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::identifiers::ArtifactId;
use crate::core::identifiers::DecisionId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::RunNodeId;
use crate::core::identifiers::TreeId;
use crate::core::identifiers::TreeNodeId;
use crate::core::identifiers::WorktreeId;
use crate::core::status::NodeStatus;
use crate::core::status::RunStatus;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Run Records
// ============================================================================

/// Workflow run row.
///
/// # Invariants
/// - `completed_at` is set exactly when `status` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run identifier.
    pub id: RunId,
    /// Tree version this run was materialized from.
    pub tree_id: TreeId,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Time the run first entered `running`.
    pub started_at: Option<Timestamp>,
    /// Time the run entered a terminal status.
    pub completed_at: Option<Timestamp>,
    /// Row creation time.
    pub created_at: Timestamp,
    /// Last mutation time.
    pub updated_at: Timestamp,
}

/// Run-node row: one logical node instance per run.
///
/// # Invariants
/// - At most one live row per `(run_id, tree_node_id)`.
/// - `attempt` starts at 1 and only increases.
/// - Revisits clear `started_at` and `completed_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunNode {
    /// Run-node identifier.
    pub id: RunNodeId,
    /// Owning run identifier.
    pub run_id: RunId,
    /// Tree node this row instantiates.
    pub tree_node_id: TreeNodeId,
    /// Stable node key copied from the tree node.
    pub node_key: String,
    /// Lifecycle status.
    pub status: NodeStatus,
    /// Retry/revisit counter (>= 1).
    pub attempt: i64,
    /// Deterministic ordering index copied from the tree node.
    pub sequence_index: i64,
    /// Time the current attempt was claimed.
    pub started_at: Option<Timestamp>,
    /// Time the current attempt settled.
    pub completed_at: Option<Timestamp>,
    /// Last mutation time.
    pub updated_at: Timestamp,
}

// ============================================================================
// SECTION: Artifacts
// ============================================================================

/// Kind of artifact a phase produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    /// Primary phase output handed downstream as context.
    Report,
    /// Failure or bookkeeping log entry.
    Log,
}

impl ArtifactType {
    /// Returns the stable TEXT form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Report => "report",
            Self::Log => "log",
        }
    }

    /// Parses the stable TEXT form (returns `None` for unknown values).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "report" => Some(Self::Report),
            "log" => Some(Self::Log),
            _ => None,
        }
    }
}

/// Content type of an artifact body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Plain text.
    Text,
    /// Markdown.
    Markdown,
    /// JSON document.
    Json,
    /// Unified diff.
    Diff,
}

impl ContentType {
    /// Returns the stable TEXT form stored in the database and envelopes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Markdown => "markdown",
            Self::Json => "json",
            Self::Diff => "diff",
        }
    }

    /// Parses the stable TEXT form (returns `None` for unknown values).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "markdown" => Some(Self::Markdown),
            "json" => Some(Self::Json),
            "diff" => Some(Self::Diff),
            _ => None,
        }
    }
}

/// Persisted phase artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseArtifact {
    /// Artifact identifier.
    pub id: ArtifactId,
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
    /// Dynamic metadata blob (tokens, event counts, context manifest).
    pub metadata: Value,
    /// Row creation time.
    pub created_at: Timestamp,
}

// ============================================================================
// SECTION: Routing Decisions
// ============================================================================

/// Routing signal emitted by a completed phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSignal {
    /// Phase approved its input; take the success path.
    Approved,
    /// Phase requests upstream changes; usually routes a loopback.
    ChangesRequested,
    /// Phase is blocked on something external.
    Blocked,
    /// Phase asks for its own retry.
    Retry,
    /// No outgoing edge matched a decision; terminal routing failure.
    NoRoute,
}

impl DecisionSignal {
    /// Returns the stable TEXT form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
            Self::Blocked => "blocked",
            Self::Retry => "retry",
            Self::NoRoute => "no_route",
        }
    }

    /// Parses the stable TEXT form (returns `None` for unknown values).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approved" => Some(Self::Approved),
            "changes_requested" => Some(Self::ChangesRequested),
            "blocked" => Some(Self::Blocked),
            "retry" => Some(Self::Retry),
            "no_route" => Some(Self::NoRoute),
            _ => None,
        }
    }
}

/// Persisted routing decision.
///
/// # Invariants
/// - A decision applies to the current attempt only when `attempt` equals the
///   run-node's attempt (a NULL attempt from historical rows is stale) and
///   `created_at` is not older than the node's latest artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Decision identifier.
    pub id: DecisionId,
    /// Owning run identifier.
    pub run_id: RunId,
    /// Deciding run-node identifier.
    pub run_node_id: RunNodeId,
    /// Decision signal.
    pub decision: DecisionSignal,
    /// Optional free-form rationale.
    pub rationale: Option<String>,
    /// Attempt the decision was recorded for (NULL on historical rows).
    pub attempt: Option<i64>,
    /// Raw provider output retained for audit.
    pub raw_output: Option<Value>,
    /// Row creation time.
    pub created_at: Timestamp,
}

// ============================================================================
// SECTION: Diagnostics and Stream Events
// ============================================================================

/// Persisted per-attempt diagnostics row.
///
/// # Invariants
/// - At most one row per `(run_id, run_node_id, attempt)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunNodeDiagnostics {
    /// Diagnostics row identifier.
    pub id: i64,
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
    /// True when any redaction fired while assembling the payload.
    pub redacted: bool,
    /// True when events or previews were dropped to fit caps.
    pub truncated: bool,
    /// Serialized payload length in characters.
    pub payload_chars: i64,
    /// Full diagnostics payload (schema version 1).
    pub diagnostics: Value,
}

/// Persisted provider stream event.
///
/// # Invariants
/// - `sequence` is gap-free and strictly increasing per
///   `(run_node_id, attempt)`, starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunNodeStreamEvent {
    /// Stream event row identifier.
    pub id: i64,
    /// Owning run identifier.
    pub run_id: RunId,
    /// Producing run-node identifier.
    pub run_node_id: RunNodeId,
    /// Attempt the event belongs to.
    pub attempt: i64,
    /// Monotonic sequence within the attempt.
    pub sequence: i64,
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

// ============================================================================
// SECTION: Worktrees
// ============================================================================

/// Run worktree row managed by the external repository-sync adapter.
///
/// The core only reads these rows to resolve a run's working directory; the
/// latest `active` row is the primary worktree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunWorktree {
    /// Worktree identifier.
    pub id: WorktreeId,
    /// Owning run identifier.
    pub run_id: RunId,
    /// Absolute path of the worktree on disk.
    pub path: String,
    /// Adapter-owned status label (`active` marks the primary row).
    pub status: String,
    /// Row creation time.
    pub created_at: Timestamp,
}
