// crates/alphred-core/src/runtime/store.rs
// ============================================================================
// Module: Alphred In-Memory Workflow Store
// Description: Reference WorkflowStore used by hosts and tests.
// Purpose: Provide the full store contract without a database.
// Dependencies: crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! The in-memory store implements the complete [`WorkflowStore`] contract,
//! including guarded transitions, gap-free stream sequences, idempotent
//! diagnostics inserts, and the draft lifecycle. Timestamps come from an
//! internal logical counter so test runs are fully deterministic; only the
//! relative order of stamps matters to the scheduler.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;

use crate::core::ArtifactId;
use crate::core::DecisionId;
use crate::core::GuardDefinition;
use crate::core::GuardId;
use crate::core::NodeStatus;
use crate::core::PhaseArtifact;
use crate::core::PromptTemplate;
use crate::core::PromptTemplateId;
use crate::core::RoutingDecision;
use crate::core::RunId;
use crate::core::RunNode;
use crate::core::RunNodeDiagnostics;
use crate::core::RunNodeStreamEvent;
use crate::core::RunStatus;
use crate::core::RunWorktree;
use crate::core::Timestamp;
use crate::core::TreeEdge;
use crate::core::TreeId;
use crate::core::TreeNode;
use crate::core::TreeNodeId;
use crate::core::TreeStatus;
use crate::core::WorkflowRun;
use crate::core::WorkflowTree;
use crate::core::WorktreeId;
use crate::interfaces::LatestArtifact;
use crate::interfaces::NewArtifact;
use crate::interfaces::NewDiagnostics;
use crate::interfaces::NewRoutingDecision;
use crate::interfaces::NewRunNode;
use crate::interfaces::NewStreamEvent;
use crate::interfaces::NodeTransition;
use crate::interfaces::StoreError;
use crate::interfaces::StoreSessionFactory;
use crate::interfaces::TimestampAction;
use crate::interfaces::TreeDefinition;
use crate::interfaces::WorkflowStore;

// ============================================================================
// SECTION: Inner State
// ============================================================================

/// Mutable tables behind the store mutex.
#[derive(Debug, Default)]
struct Inner {
    /// Logical clock; every stamp increments it.
    now_millis: i64,
    /// Next rowid, shared across tables for simplicity.
    next_id: i64,
    /// Workflow tree rows by id.
    trees: BTreeMap<i64, WorkflowTree>,
    /// Tree node rows by id.
    tree_nodes: BTreeMap<i64, TreeNode>,
    /// Tree edge rows by id.
    tree_edges: BTreeMap<i64, TreeEdge>,
    /// Guard definition rows by id.
    guards: BTreeMap<i64, GuardDefinition>,
    /// Prompt template rows by id.
    templates: BTreeMap<i64, PromptTemplate>,
    /// Workflow run rows by id.
    runs: BTreeMap<i64, WorkflowRun>,
    /// Run node rows by id.
    run_nodes: BTreeMap<i64, RunNode>,
    /// Phase artifact rows in insertion order.
    artifacts: Vec<PhaseArtifact>,
    /// Routing decision rows in insertion order.
    decisions: Vec<RoutingDecision>,
    /// Diagnostics rows in insertion order.
    diagnostics: Vec<RunNodeDiagnostics>,
    /// Stream event rows in insertion order.
    stream_events: Vec<RunNodeStreamEvent>,
    /// Worktree rows in insertion order.
    worktrees: Vec<RunWorktree>,
}

impl Inner {
    /// Advances the logical clock and returns the new stamp.
    fn tick(&mut self) -> Timestamp {
        self.now_millis += 1;
        Timestamp::from_unix_millis(self.now_millis)
    }

    /// Allocates the next rowid.
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// In-memory [`WorkflowStore`] with full contract semantics.
///
/// # Invariants
/// - All access is serialized through one mutex.
/// - Logical timestamps strictly increase per mutation.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkflowStore {
    /// Shared mutable tables.
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryWorkflowStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the inner tables.
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Io("in-memory store mutex poisoned".to_string()))
    }
}

/// Session factory cloning handles onto the same shared tables.
///
/// Background tasks get an independent handle while observing the same data,
/// mirroring separate connections onto one database.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionFactory {
    /// Store every session shares.
    store: InMemoryWorkflowStore,
}

impl InMemorySessionFactory {
    /// Creates a factory over a fresh store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle to the shared store.
    #[must_use]
    pub fn store(&self) -> InMemoryWorkflowStore {
        self.store.clone()
    }
}

impl StoreSessionFactory for InMemorySessionFactory {
    type Store = InMemoryWorkflowStore;

    fn open_session(&self) -> Result<Self::Store, StoreError> {
        Ok(self.store.clone())
    }
}

// ============================================================================
// SECTION: Definition Validation
// ============================================================================

/// Validates a draft definition before it replaces tree content.
fn validate_definition(definition: &TreeDefinition) -> Result<(), StoreError> {
    let mut keys = BTreeSet::new();
    for node in &definition.nodes {
        if node.node_key.is_empty() {
            return Err(StoreError::Invalid("node_key must not be empty".to_string()));
        }
        if node.max_retries < 0 {
            return Err(StoreError::Invalid(format!(
                "max_retries must be >= 0 for node {}",
                node.node_key
            )));
        }
        if !keys.insert(node.node_key.as_str()) {
            return Err(StoreError::Invalid(format!("duplicate node_key: {}", node.node_key)));
        }
        if let Some(index) = node.template_index
            && index >= definition.templates.len()
        {
            return Err(StoreError::Invalid(format!(
                "template_index {index} out of range for node {}",
                node.node_key
            )));
        }
    }
    let mut priorities = BTreeSet::new();
    for edge in &definition.edges {
        if edge.priority < 0 {
            return Err(StoreError::Invalid("edge priority must be >= 0".to_string()));
        }
        if !keys.contains(edge.source_node_key.as_str()) {
            return Err(StoreError::Invalid(format!(
                "edge references unknown source node: {}",
                edge.source_node_key
            )));
        }
        if !keys.contains(edge.target_node_key.as_str()) {
            return Err(StoreError::Invalid(format!(
                "edge references unknown target node: {}",
                edge.target_node_key
            )));
        }
        if let Some(index) = edge.guard_index
            && index >= definition.guards.len()
        {
            return Err(StoreError::Invalid(format!(
                "guard_index {index} out of range for edge {} -> {}",
                edge.source_node_key, edge.target_node_key
            )));
        }
        if !priorities.insert((edge.source_node_key.as_str(), edge.route_on.as_str(), edge.priority)) {
            return Err(StoreError::Invalid(format!(
                "duplicate priority {} on source {} lane {}",
                edge.priority,
                edge.source_node_key,
                edge.route_on.as_str()
            )));
        }
    }
    Ok(())
}

// ============================================================================
// SECTION: WorkflowStore Implementation
// ============================================================================

impl WorkflowStore for InMemoryWorkflowStore {
    fn load_tree(&self, tree_id: TreeId) -> Result<Option<WorkflowTree>, StoreError> {
        Ok(self.lock()?.trees.get(&tree_id.get()).cloned())
    }

    fn find_latest_published_tree(
        &self,
        tree_key: &str,
    ) -> Result<Option<WorkflowTree>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .trees
            .values()
            .filter(|tree| tree.tree_key == tree_key && tree.status == TreeStatus::Published)
            .max_by_key(|tree| tree.version)
            .cloned())
    }

    fn load_tree_nodes(&self, tree_id: TreeId) -> Result<Vec<TreeNode>, StoreError> {
        let inner = self.lock()?;
        let mut nodes: Vec<TreeNode> =
            inner.tree_nodes.values().filter(|node| node.tree_id == tree_id).cloned().collect();
        nodes.sort_by(|left, right| {
            left.sequence_index
                .cmp(&right.sequence_index)
                .then_with(|| left.node_key.as_bytes().cmp(right.node_key.as_bytes()))
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(nodes)
    }

    fn load_tree_edges(&self, tree_id: TreeId) -> Result<Vec<TreeEdge>, StoreError> {
        let inner = self.lock()?;
        let mut edges: Vec<TreeEdge> =
            inner.tree_edges.values().filter(|edge| edge.tree_id == tree_id).cloned().collect();
        edges.sort_by(|left, right| {
            left.priority
                .cmp(&right.priority)
                .then_with(|| left.target_node_id.cmp(&right.target_node_id))
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(edges)
    }

    fn load_guard(&self, guard_id: GuardId) -> Result<Option<GuardDefinition>, StoreError> {
        Ok(self.lock()?.guards.get(&guard_id.get()).cloned())
    }

    fn load_prompt_template(
        &self,
        template_id: PromptTemplateId,
    ) -> Result<Option<PromptTemplate>, StoreError> {
        Ok(self.lock()?.templates.get(&template_id.get()).cloned())
    }

    fn create_draft_tree(&self, tree_key: &str, name: &str) -> Result<WorkflowTree, StoreError> {
        let mut inner = self.lock()?;
        if inner
            .trees
            .values()
            .any(|tree| tree.tree_key == tree_key && tree.status == TreeStatus::Draft)
        {
            return Err(StoreError::Conflict(format!(
                "a draft already exists for tree key {tree_key}"
            )));
        }
        let next_version = inner
            .trees
            .values()
            .filter(|tree| tree.tree_key == tree_key)
            .map(|tree| tree.version)
            .max()
            .unwrap_or(0)
            + 1;
        let id = inner.allocate_id();
        let now = inner.tick();
        let tree = WorkflowTree {
            id: TreeId::from_raw(id)
                .ok_or_else(|| StoreError::Invalid("allocated non-positive tree id".to_string()))?,
            tree_key: tree_key.to_string(),
            version: next_version,
            status: TreeStatus::Draft,
            name: name.to_string(),
            draft_revision: 0,
            created_at: now,
            updated_at: now,
        };
        inner.trees.insert(id, tree.clone());
        Ok(tree)
    }

    fn save_draft_tree(
        &self,
        tree_id: TreeId,
        expected_revision: i64,
        definition: &TreeDefinition,
    ) -> Result<i64, StoreError> {
        validate_definition(definition)?;
        let mut inner = self.lock()?;
        let tree = inner
            .trees
            .get(&tree_id.get())
            .ok_or_else(|| StoreError::NotFound(format!("workflow tree {tree_id}")))?
            .clone();
        if tree.status != TreeStatus::Draft {
            return Err(StoreError::Invalid(format!("tree {tree_id} is not a draft")));
        }
        if tree.draft_revision != expected_revision {
            return Err(StoreError::Conflict(format!(
                "draft revision mismatch on tree {tree_id}: expected {expected_revision}, stored {}",
                tree.draft_revision
            )));
        }

        inner.tree_nodes.retain(|_, node| node.tree_id != tree_id);
        inner.tree_edges.retain(|_, edge| edge.tree_id != tree_id);

        let mut template_ids = Vec::with_capacity(definition.templates.len());
        for template in &definition.templates {
            let id = inner.allocate_id();
            let template_id = PromptTemplateId::from_raw(id).ok_or_else(|| {
                StoreError::Invalid("allocated non-positive template id".to_string())
            })?;
            inner.templates.insert(
                id,
                PromptTemplate {
                    id: template_id,
                    name: template.name.clone(),
                    content_type: template.content_type.clone(),
                    body: template.body.clone(),
                },
            );
            template_ids.push(template_id);
        }
        let mut guard_ids = Vec::with_capacity(definition.guards.len());
        for expression in &definition.guards {
            let id = inner.allocate_id();
            let guard_id = GuardId::from_raw(id).ok_or_else(|| {
                StoreError::Invalid("allocated non-positive guard id".to_string())
            })?;
            inner.guards.insert(
                id,
                GuardDefinition {
                    id: guard_id,
                    expression: expression.clone(),
                },
            );
            guard_ids.push(guard_id);
        }

        let mut node_ids: BTreeMap<&str, TreeNodeId> = BTreeMap::new();
        for node in &definition.nodes {
            let id = inner.allocate_id();
            let node_id = TreeNodeId::from_raw(id).ok_or_else(|| {
                StoreError::Invalid("allocated non-positive tree node id".to_string())
            })?;
            node_ids.insert(node.node_key.as_str(), node_id);
            inner.tree_nodes.insert(
                id,
                TreeNode {
                    id: node_id,
                    tree_id,
                    node_key: node.node_key.clone(),
                    node_type: node.node_type,
                    node_role: node.node_role,
                    provider: node.provider.clone(),
                    model: node.model.clone(),
                    execution_permissions: node.execution_permissions.clone(),
                    prompt_template_id: node
                        .template_index
                        .and_then(|index| template_ids.get(index).copied()),
                    max_retries: node.max_retries,
                    sequence_index: node.sequence_index,
                    position: None,
                },
            );
        }
        for edge in &definition.edges {
            let id = inner.allocate_id();
            let edge_id = crate::core::EdgeId::from_raw(id).ok_or_else(|| {
                StoreError::Invalid("allocated non-positive edge id".to_string())
            })?;
            let source = node_ids.get(edge.source_node_key.as_str()).copied().ok_or_else(|| {
                StoreError::Invalid(format!("unknown source node {}", edge.source_node_key))
            })?;
            let target = node_ids.get(edge.target_node_key.as_str()).copied().ok_or_else(|| {
                StoreError::Invalid(format!("unknown target node {}", edge.target_node_key))
            })?;
            inner.tree_edges.insert(
                id,
                TreeEdge {
                    id: edge_id,
                    tree_id,
                    source_node_id: source,
                    target_node_id: target,
                    priority: edge.priority,
                    auto: edge.auto,
                    guard_definition_id: edge
                        .guard_index
                        .and_then(|index| guard_ids.get(index).copied()),
                    route_on: edge.route_on,
                },
            );
        }

        let now = inner.tick();
        let stored = inner
            .trees
            .get_mut(&tree_id.get())
            .ok_or_else(|| StoreError::NotFound(format!("workflow tree {tree_id}")))?;
        stored.draft_revision += 1;
        stored.updated_at = now;
        Ok(stored.draft_revision)
    }

    fn publish_draft_tree(
        &self,
        tree_id: TreeId,
        expected_revision: i64,
    ) -> Result<i64, StoreError> {
        let mut inner = self.lock()?;
        let tree = inner
            .trees
            .get(&tree_id.get())
            .ok_or_else(|| StoreError::NotFound(format!("workflow tree {tree_id}")))?
            .clone();
        if tree.status != TreeStatus::Draft {
            return Err(StoreError::Invalid(format!("tree {tree_id} is not a draft")));
        }
        if tree.draft_revision != expected_revision {
            return Err(StoreError::Conflict(format!(
                "draft revision mismatch on tree {tree_id}: expected {expected_revision}, stored {}",
                tree.draft_revision
            )));
        }
        let version = inner
            .trees
            .values()
            .filter(|row| row.tree_key == tree.tree_key && row.status == TreeStatus::Published)
            .map(|row| row.version)
            .max()
            .unwrap_or(0)
            + 1;
        let now = inner.tick();
        let stored = inner
            .trees
            .get_mut(&tree_id.get())
            .ok_or_else(|| StoreError::NotFound(format!("workflow tree {tree_id}")))?;
        stored.version = version;
        stored.status = TreeStatus::Published;
        stored.draft_revision = 0;
        stored.updated_at = now;
        Ok(version)
    }

    fn load_run(&self, run_id: RunId) -> Result<Option<WorkflowRun>, StoreError> {
        Ok(self.lock()?.runs.get(&run_id.get()).cloned())
    }

    fn list_runs(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        Ok(self.lock()?.runs.values().cloned().collect())
    }

    fn create_run_with_nodes(
        &self,
        tree_id: TreeId,
        nodes: &[NewRunNode],
    ) -> Result<RunId, StoreError> {
        let mut inner = self.lock()?;
        if !inner.trees.contains_key(&tree_id.get()) {
            return Err(StoreError::NotFound(format!("workflow tree {tree_id}")));
        }
        let run_raw = inner.allocate_id();
        let run_id = RunId::from_raw(run_raw)
            .ok_or_else(|| StoreError::Invalid("allocated non-positive run id".to_string()))?;
        let now = inner.tick();
        inner.runs.insert(
            run_raw,
            WorkflowRun {
                id: run_id,
                tree_id,
                status: RunStatus::Pending,
                started_at: None,
                completed_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        for node in nodes {
            let node_raw = inner.allocate_id();
            let node_id = crate::core::RunNodeId::from_raw(node_raw).ok_or_else(|| {
                StoreError::Invalid("allocated non-positive run node id".to_string())
            })?;
            let now = inner.tick();
            inner.run_nodes.insert(
                node_raw,
                RunNode {
                    id: node_id,
                    run_id,
                    tree_node_id: node.tree_node_id,
                    node_key: node.node_key.clone(),
                    status: NodeStatus::Pending,
                    attempt: 1,
                    sequence_index: node.sequence_index,
                    started_at: None,
                    completed_at: None,
                    updated_at: now,
                },
            );
        }
        Ok(run_id)
    }

    fn transition_run(
        &self,
        run_id: RunId,
        expected_status: RunStatus,
        new_status: RunStatus,
    ) -> Result<(), StoreError> {
        if !expected_status.can_transition_to(new_status) {
            return Err(StoreError::Invalid(format!(
                "run transition {expected_status} -> {new_status} is not allowed"
            )));
        }
        let mut inner = self.lock()?;
        let now = inner.tick();
        let run = inner
            .runs
            .get_mut(&run_id.get())
            .ok_or_else(|| StoreError::NotFound(format!("workflow run {run_id}")))?;
        if run.status != expected_status {
            return Err(StoreError::Precondition {
                entity: "workflow_run".to_string(),
                detail: format!(
                    "run {run_id}: expected {expected_status}, observed {}",
                    run.status
                ),
            });
        }
        run.status = new_status;
        run.updated_at = now;
        if new_status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if new_status.is_terminal() {
            run.completed_at = Some(now);
        }
        Ok(())
    }

    fn load_run_nodes(&self, run_id: RunId) -> Result<Vec<RunNode>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.run_nodes.values().filter(|node| node.run_id == run_id).cloned().collect())
    }

    fn load_run_node(
        &self,
        run_node_id: crate::core::RunNodeId,
    ) -> Result<Option<RunNode>, StoreError> {
        Ok(self.lock()?.run_nodes.get(&run_node_id.get()).cloned())
    }

    fn transition_node(&self, transition: &NodeTransition) -> Result<(), StoreError> {
        if !transition.expected_status.can_transition_to(transition.new_status) {
            return Err(StoreError::Invalid(format!(
                "node transition {} -> {} is not allowed",
                transition.expected_status, transition.new_status
            )));
        }
        let mut inner = self.lock()?;
        let now = inner.tick();
        let node = inner
            .run_nodes
            .get_mut(&transition.run_node_id.get())
            .ok_or_else(|| StoreError::NotFound(format!("run node {}", transition.run_node_id)))?;
        if node.status != transition.expected_status || node.attempt != transition.expected_attempt
        {
            return Err(StoreError::Precondition {
                entity: "run_node".to_string(),
                detail: format!(
                    "node {}: expected {}/{}, observed {}/{}",
                    transition.run_node_id,
                    transition.expected_status,
                    transition.expected_attempt,
                    node.status,
                    node.attempt
                ),
            });
        }
        node.status = transition.new_status;
        if transition.increment_attempt {
            node.attempt += 1;
        }
        match transition.started_at {
            TimestampAction::Keep => {}
            TimestampAction::SetNow => node.started_at = Some(now),
            TimestampAction::Clear => node.started_at = None,
        }
        match transition.completed_at {
            TimestampAction::Keep => {}
            TimestampAction::SetNow => node.completed_at = Some(now),
            TimestampAction::Clear => node.completed_at = None,
        }
        node.updated_at = now;
        Ok(())
    }

    fn requeue_failed_nodes(
        &self,
        run_id: RunId,
    ) -> Result<Vec<crate::core::RunNodeId>, StoreError> {
        let mut inner = self.lock()?;
        let run = inner
            .runs
            .get(&run_id.get())
            .ok_or_else(|| StoreError::NotFound(format!("workflow run {run_id}")))?;
        if run.status != RunStatus::Failed {
            return Err(StoreError::Precondition {
                entity: "workflow_run".to_string(),
                detail: format!("run {run_id}: expected failed, observed {}", run.status),
            });
        }
        let failed: Vec<i64> = inner
            .run_nodes
            .values()
            .filter(|node| node.run_id == run_id && node.status == NodeStatus::Failed)
            .map(|node| node.id.get())
            .collect();
        if failed.is_empty() {
            return Ok(Vec::new());
        }
        let mut requeued = Vec::with_capacity(failed.len());
        for raw in failed {
            let now = inner.tick();
            if let Some(node) = inner.run_nodes.get_mut(&raw) {
                node.status = NodeStatus::Pending;
                node.attempt += 1;
                node.started_at = None;
                node.completed_at = None;
                node.updated_at = now;
                requeued.push(node.id);
            }
        }
        let now = inner.tick();
        if let Some(run) = inner.runs.get_mut(&run_id.get()) {
            run.status = RunStatus::Running;
            run.completed_at = None;
            run.updated_at = now;
        }
        requeued.sort();
        Ok(requeued)
    }

    fn insert_artifact(&self, artifact: &NewArtifact) -> Result<ArtifactId, StoreError> {
        let mut inner = self.lock()?;
        let id = inner.allocate_id();
        let artifact_id = ArtifactId::from_raw(id)
            .ok_or_else(|| StoreError::Invalid("allocated non-positive artifact id".to_string()))?;
        let now = inner.tick();
        inner.artifacts.push(PhaseArtifact {
            id: artifact_id,
            run_id: artifact.run_id,
            run_node_id: artifact.run_node_id,
            artifact_type: artifact.artifact_type,
            content_type: artifact.content_type,
            content: artifact.content.clone(),
            metadata: artifact.metadata.clone(),
            created_at: now,
        });
        Ok(artifact_id)
    }

    fn load_artifacts(&self, run_id: RunId) -> Result<Vec<PhaseArtifact>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .artifacts
            .iter()
            .filter(|artifact| artifact.run_id == run_id)
            .cloned()
            .collect())
    }

    fn latest_artifacts_by_run_node(
        &self,
        run_id: RunId,
    ) -> Result<Vec<LatestArtifact>, StoreError> {
        let inner = self.lock()?;
        let mut latest: BTreeMap<crate::core::RunNodeId, LatestArtifact> = BTreeMap::new();
        for artifact in inner.artifacts.iter().filter(|artifact| artifact.run_id == run_id) {
            latest.insert(
                artifact.run_node_id,
                LatestArtifact {
                    run_node_id: artifact.run_node_id,
                    artifact_id: artifact.id,
                    created_at: artifact.created_at,
                },
            );
        }
        Ok(latest.into_values().collect())
    }

    fn insert_routing_decision(
        &self,
        decision: &NewRoutingDecision,
    ) -> Result<DecisionId, StoreError> {
        let mut inner = self.lock()?;
        let id = inner.allocate_id();
        let decision_id = DecisionId::from_raw(id)
            .ok_or_else(|| StoreError::Invalid("allocated non-positive decision id".to_string()))?;
        let now = inner.tick();
        inner.decisions.push(RoutingDecision {
            id: decision_id,
            run_id: decision.run_id,
            run_node_id: decision.run_node_id,
            decision: decision.decision,
            rationale: decision.rationale.clone(),
            attempt: decision.attempt,
            raw_output: decision.raw_output.clone(),
            created_at: now,
        });
        Ok(decision_id)
    }

    fn latest_routing_decisions(&self, run_id: RunId) -> Result<Vec<RoutingDecision>, StoreError> {
        let inner = self.lock()?;
        let mut latest: BTreeMap<crate::core::RunNodeId, RoutingDecision> = BTreeMap::new();
        for decision in inner.decisions.iter().filter(|decision| decision.run_id == run_id) {
            match latest.get(&decision.run_node_id) {
                Some(current)
                    if (current.created_at, current.id) >= (decision.created_at, decision.id) => {}
                _ => {
                    latest.insert(decision.run_node_id, decision.clone());
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    fn insert_diagnostics(&self, diagnostics: &NewDiagnostics) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let exists = inner.diagnostics.iter().any(|row| {
            row.run_id == diagnostics.run_id
                && row.run_node_id == diagnostics.run_node_id
                && row.attempt == diagnostics.attempt
        });
        if exists {
            return Ok(false);
        }
        let id = inner.allocate_id();
        inner.diagnostics.push(RunNodeDiagnostics {
            id,
            run_id: diagnostics.run_id,
            run_node_id: diagnostics.run_node_id,
            attempt: diagnostics.attempt,
            outcome: diagnostics.outcome.clone(),
            counts: diagnostics.counts.clone(),
            redacted: diagnostics.redacted,
            truncated: diagnostics.truncated,
            payload_chars: diagnostics.payload_chars,
            diagnostics: diagnostics.diagnostics.clone(),
        });
        Ok(true)
    }

    fn load_diagnostics(
        &self,
        run_id: RunId,
        run_node_id: crate::core::RunNodeId,
    ) -> Result<Vec<RunNodeDiagnostics>, StoreError> {
        let inner = self.lock()?;
        let mut rows: Vec<RunNodeDiagnostics> = inner
            .diagnostics
            .iter()
            .filter(|row| row.run_id == run_id && row.run_node_id == run_node_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.attempt);
        Ok(rows)
    }

    fn append_stream_events(
        &self,
        run_id: RunId,
        run_node_id: crate::core::RunNodeId,
        attempt: i64,
        events: &[NewStreamEvent],
    ) -> Result<i64, StoreError> {
        let mut inner = self.lock()?;
        let max_sequence = inner
            .stream_events
            .iter()
            .filter(|event| event.run_node_id == run_node_id && event.attempt == attempt)
            .map(|event| event.sequence)
            .max()
            .unwrap_or(0);
        let first = max_sequence + 1;
        for (offset, event) in events.iter().enumerate() {
            let id = inner.allocate_id();
            let sequence = first + i64::try_from(offset).unwrap_or(i64::MAX);
            inner.stream_events.push(RunNodeStreamEvent {
                id,
                run_id,
                run_node_id,
                attempt,
                sequence,
                event_type: event.event_type.clone(),
                timestamp: event.timestamp,
                content_chars: event.content_chars,
                content_preview: event.content_preview.clone(),
                metadata: event.metadata.clone(),
                usage_delta_tokens: event.usage_delta_tokens,
                usage_cumulative_tokens: event.usage_cumulative_tokens,
            });
        }
        Ok(first)
    }

    fn stream_events_after(
        &self,
        run_node_id: crate::core::RunNodeId,
        attempt: i64,
        cursor: i64,
    ) -> Result<Vec<RunNodeStreamEvent>, StoreError> {
        let inner = self.lock()?;
        let mut rows: Vec<RunNodeStreamEvent> = inner
            .stream_events
            .iter()
            .filter(|event| {
                event.run_node_id == run_node_id
                    && event.attempt == attempt
                    && event.sequence > cursor
            })
            .cloned()
            .collect();
        rows.sort_by_key(|event| event.sequence);
        Ok(rows)
    }

    fn insert_worktree(
        &self,
        run_id: RunId,
        path: &str,
        status: &str,
    ) -> Result<WorktreeId, StoreError> {
        let mut inner = self.lock()?;
        let id = inner.allocate_id();
        let worktree_id = WorktreeId::from_raw(id)
            .ok_or_else(|| StoreError::Invalid("allocated non-positive worktree id".to_string()))?;
        let now = inner.tick();
        inner.worktrees.push(RunWorktree {
            id: worktree_id,
            run_id,
            path: path.to_string(),
            status: status.to_string(),
            created_at: now,
        });
        Ok(worktree_id)
    }

    fn latest_active_worktree(&self, run_id: RunId) -> Result<Option<RunWorktree>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .worktrees
            .iter()
            .filter(|worktree| worktree.run_id == run_id && worktree.status == "active")
            .max_by_key(|worktree| worktree.id)
            .cloned())
    }
}
