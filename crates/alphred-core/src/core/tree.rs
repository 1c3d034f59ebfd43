// crates/alphred-core/src/core/tree.rs
// ============================================================================
// Module: Alphred Workflow Tree Model
// Description: Versioned workflow definitions: trees, nodes, edges, templates.
// Purpose: Capture the static graph the planner materializes into runs.
// Dependencies: crate::core::{guard, identifiers, time}, serde
// ============================================================================

//! ## Overview
//! A workflow tree is a versioned definition of nodes and guarded edges.
//! Draft trees mutate under an optimistic `draft_revision` counter; published
//! trees are immutable and uniquely identified by `(tree_key, version)`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::guard::GuardExpression;
use crate::core::identifiers::EdgeId;
use crate::core::identifiers::GuardId;
use crate::core::identifiers::PromptTemplateId;
use crate::core::identifiers::TreeId;
use crate::core::identifiers::TreeNodeId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Tree Status
// ============================================================================

/// Workflow tree lifecycle status.
///
/// # Invariants
/// - Published trees are immutable; `draft_revision` is 0 on published rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeStatus {
    /// Tree is editable; saves bump `draft_revision` by exactly 1.
    Draft,
    /// Tree is frozen and runnable.
    Published,
}

impl TreeStatus {
    /// Returns the stable TEXT form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
        }
    }

    /// Parses the stable TEXT form (returns `None` for unknown values).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "published" => Some(Self::Published),
            _ => None,
        }
    }
}

// ============================================================================
// SECTION: Node Classification
// ============================================================================

/// Kind of work a tree node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Agent-executed phase driven through a provider.
    Agent,
    /// Human checkpoint awaiting an external decision.
    Human,
    /// Deterministic tool invocation.
    Tool,
}

impl NodeType {
    /// Returns the stable TEXT form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Human => "human",
            Self::Tool => "tool",
        }
    }

    /// Parses the stable TEXT form (returns `None` for unknown values).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "agent" => Some(Self::Agent),
            "human" => Some(Self::Human),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// Structural role a node plays in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Ordinary single-successor node.
    Standard,
    /// Fans work out to parallel children.
    Spawner,
    /// Joins fanned-out branches back together.
    Join,
}

impl NodeRole {
    /// Returns the stable TEXT form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Spawner => "spawner",
            Self::Join => "join",
        }
    }

    /// Parses the stable TEXT form (returns `None` for unknown values).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "standard" => Some(Self::Standard),
            "spawner" => Some(Self::Spawner),
            "join" => Some(Self::Join),
            _ => None,
        }
    }
}

/// Outcome lane an edge routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOn {
    /// Edge is considered when the source completes successfully.
    Success,
    /// Edge is reserved for failure routing.
    Failure,
}

impl RouteOn {
    /// Returns the stable TEXT form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    /// Parses the stable TEXT form (returns `None` for unknown values).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

// ============================================================================
// SECTION: Execution Permissions
// ============================================================================

/// Provider execution permissions attached to runs and nodes.
///
/// # Invariants
/// - `None` fields inherit; merging overlays node values over run values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPermissions {
    /// Approval policy label understood by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<String>,
    /// Sandbox mode label understood by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_mode: Option<String>,
    /// Whether the provider may reach the network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_access_enabled: Option<bool>,
    /// Extra directories the provider may touch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_directories: Option<Vec<String>>,
    /// Web search mode label understood by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_mode: Option<String>,
}

impl ExecutionPermissions {
    /// Overlays node-level overrides onto a run-level base.
    #[must_use]
    pub fn merged_with(&self, overrides: &Self) -> Self {
        Self {
            approval_policy: overrides.approval_policy.clone().or_else(|| self.approval_policy.clone()),
            sandbox_mode: overrides.sandbox_mode.clone().or_else(|| self.sandbox_mode.clone()),
            network_access_enabled: overrides
                .network_access_enabled
                .or(self.network_access_enabled),
            additional_directories: overrides
                .additional_directories
                .clone()
                .or_else(|| self.additional_directories.clone()),
            web_search_mode: overrides.web_search_mode.clone().or_else(|| self.web_search_mode.clone()),
        }
    }
}

// ============================================================================
// SECTION: Tree Records
// ============================================================================

/// Versioned workflow tree row.
///
/// # Invariants
/// - `(tree_key, version)` is unique.
/// - `draft_revision` increments by exactly 1 per accepted save and resets to
///   0 on publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTree {
    /// Tree identifier.
    pub id: TreeId,
    /// Stable key shared by all versions of one workflow.
    pub tree_key: String,
    /// Version number assigned at publish (drafts hold the next candidate).
    pub version: i64,
    /// Lifecycle status.
    pub status: TreeStatus,
    /// Human-readable name.
    pub name: String,
    /// Optimistic revision counter for draft edits.
    pub draft_revision: i64,
    /// Row creation time.
    pub created_at: Timestamp,
    /// Last mutation time.
    pub updated_at: Timestamp,
}

/// Node definition within a workflow tree version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Node identifier.
    pub id: TreeNodeId,
    /// Owning tree identifier.
    pub tree_id: TreeId,
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
    /// Prompt template driving the phase.
    pub prompt_template_id: Option<PromptTemplateId>,
    /// Maximum retries after the first attempt (>= 0).
    pub max_retries: i64,
    /// Deterministic ordering index within the tree.
    pub sequence_index: i64,
    /// Optional editor canvas position.
    pub position: Option<NodePosition>,
}

/// Editor canvas coordinates for a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    /// Horizontal coordinate.
    pub x: f64,
    /// Vertical coordinate.
    pub y: f64,
}

/// Guarded edge between two tree nodes.
///
/// # Invariants
/// - Per `(source_node_id, route_on)` the `priority` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEdge {
    /// Edge identifier.
    pub id: EdgeId,
    /// Owning tree identifier.
    pub tree_id: TreeId,
    /// Source node identifier.
    pub source_node_id: TreeNodeId,
    /// Target node identifier.
    pub target_node_id: TreeNodeId,
    /// Scan priority (lower scans first, >= 0).
    pub priority: i64,
    /// True when the edge matches without a routing decision.
    pub auto: bool,
    /// Optional guard evaluated against the routing decision.
    pub guard_definition_id: Option<GuardId>,
    /// Outcome lane this edge routes on.
    pub route_on: RouteOn,
}

/// Stored guard definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardDefinition {
    /// Guard identifier.
    pub id: GuardId,
    /// Recursive guard expression.
    pub expression: GuardExpression,
}

/// Prompt template attached to agent nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Template identifier.
    pub id: PromptTemplateId,
    /// Template name.
    pub name: String,
    /// Content type reports produced from this template inherit.
    pub content_type: Option<String>,
    /// Template body handed to the provider.
    pub body: String,
}

// ============================================================================
// SECTION: Tests
// ============================================================================
