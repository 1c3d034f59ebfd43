// crates/alphred-core/tests/support/mod.rs
// ============================================================================
// Module: Executor Test Support
// Description: Stub provider, tree builders, and wiring helpers.
// ============================================================================
//! ## Overview
//! Shared fixtures for executor scenario tests: a scriptable stub provider
//! with an optional mid-phase hook (for concurrency scenarios), and builders
//! that publish small trees through the draft lifecycle.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    dead_code,
    reason = "Test-support helpers may be partially used per test binary."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use alphred_core::AgentProvider;
use alphred_core::CompareOp;
use alphred_core::DecisionSignal;
use alphred_core::ExecutionOptions;
use alphred_core::GuardExpression;
use alphred_core::GuardValue;
use alphred_core::InMemoryWorkflowStore;
use alphred_core::NewTreeEdge;
use alphred_core::NewTreeNode;
use alphred_core::NodeRole;
use alphred_core::NodeType;
use alphred_core::PhaseOutput;
use alphred_core::PhaseRequest;
use alphred_core::ProviderError;
use alphred_core::ProviderEvent;
use alphred_core::ProviderResolver;
use alphred_core::RouteOn;
use alphred_core::TreeDefinition;
use alphred_core::WorkflowStore;

// ============================================================================
// SECTION: Stub Provider
// ============================================================================

/// Hook executed while a phase is "in flight" (before it settles).
pub type PhaseHook = Box<dyn Fn() + Send + Sync>;

/// One scripted phase for the stub provider.
pub struct StubPhase {
    /// Events replayed through the streaming callback.
    pub events: Vec<ProviderEvent>,
    /// Optional hook fired after events, before the outcome settles.
    pub hook: Option<PhaseHook>,
    /// Final outcome.
    pub outcome: Result<PhaseOutput, ProviderError>,
}

impl StubPhase {
    /// Builds a succeeding phase with a report and decision.
    pub fn success(report: impl Into<String>, decision: DecisionSignal) -> Self {
        Self {
            events: Vec::new(),
            hook: None,
            outcome: Ok(PhaseOutput {
                report: report.into(),
                routing_decision: Some(decision),
                rationale: None,
                tokens_used: None,
                metadata: None,
            }),
        }
    }

    /// Builds a failing phase.
    pub fn failure(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            events: Vec::new(),
            hook: None,
            outcome: Err(ProviderError::Phase {
                name: name.into(),
                message: message.into(),
                stack: None,
            }),
        }
    }

    /// Attaches streamed events.
    pub fn with_events(mut self, events: Vec<ProviderEvent>) -> Self {
        self.events = events;
        self
    }

    /// Attaches a mid-phase hook.
    pub fn with_hook(mut self, hook: PhaseHook) -> Self {
        self.hook = Some(hook);
        self
    }
}

/// Scriptable provider keyed by node key.
#[derive(Default)]
pub struct StubProvider {
    /// Scripted phase queues per node key.
    script: Mutex<BTreeMap<String, VecDeque<StubPhase>>>,
    /// Requests observed, in call order.
    requests: Mutex<Vec<PhaseRequest>>,
}

impl StubProvider {
    /// Creates an empty stub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a scripted phase for a node key.
    pub fn push(&self, node_key: &str, phase: StubPhase) {
        self.script.lock().unwrap().entry(node_key.to_string()).or_default().push_back(phase);
    }

    /// Returns the requests observed so far.
    pub fn requests(&self) -> Vec<PhaseRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl AgentProvider for StubProvider {
    fn run_phase(
        &self,
        request: &PhaseRequest,
        on_event: &mut dyn FnMut(ProviderEvent),
    ) -> Result<PhaseOutput, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        let phase = self
            .script
            .lock()
            .unwrap()
            .get_mut(&request.node_key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                panic!("no scripted phase left for node {}", request.node_key)
            });
        for event in phase.events {
            on_event(event);
        }
        if let Some(hook) = phase.hook {
            hook();
        }
        phase.outcome
    }
}

/// Resolver handing every name to the shared stub.
#[derive(Clone)]
pub struct StubResolver {
    /// Shared stub provider.
    pub provider: Arc<StubProvider>,
}

impl ProviderResolver for StubResolver {
    fn resolve(
        &self,
        _provider: &str,
    ) -> Result<Arc<dyn AgentProvider>, alphred_core::ProviderError> {
        Ok(Arc::clone(&self.provider) as Arc<dyn AgentProvider>)
    }
}

// ============================================================================
// SECTION: Tree Builders
// ============================================================================

/// Builds an agent node definition.
pub fn agent_node(node_key: &str, sequence_index: i64, max_retries: i64) -> NewTreeNode {
    NewTreeNode {
        node_key: node_key.to_string(),
        node_type: NodeType::Agent,
        node_role: NodeRole::Standard,
        provider: Some("stub".to_string()),
        model: None,
        execution_permissions: None,
        template_index: None,
        max_retries,
        sequence_index,
    }
}

/// Builds an auto success edge.
pub fn auto_edge(source: &str, target: &str, priority: i64) -> NewTreeEdge {
    NewTreeEdge {
        source_node_key: source.to_string(),
        target_node_key: target.to_string(),
        priority,
        auto: true,
        guard_index: None,
        route_on: RouteOn::Success,
    }
}

/// Builds a guarded success edge referencing a guard index.
pub fn guarded_edge(source: &str, target: &str, priority: i64, guard_index: usize) -> NewTreeEdge {
    NewTreeEdge {
        source_node_key: source.to_string(),
        target_node_key: target.to_string(),
        priority,
        auto: false,
        guard_index: Some(guard_index),
        route_on: RouteOn::Success,
    }
}

/// Builds a guard matching one decision signal.
pub fn decision_guard(signal: &str) -> GuardExpression {
    GuardExpression::Comparison {
        field: "decision".to_string(),
        operator: CompareOp::Eq,
        value: GuardValue::String(signal.to_string()),
    }
}

/// The linear demo tree: design -> implement -> review (all auto).
pub fn linear_definition(max_retries: i64) -> TreeDefinition {
    TreeDefinition {
        nodes: vec![
            agent_node("design", 0, max_retries),
            agent_node("implement", 1, max_retries),
            agent_node("review", 2, max_retries),
        ],
        edges: vec![auto_edge("design", "implement", 0), auto_edge("implement", "review", 0)],
        guards: Vec::new(),
        templates: Vec::new(),
    }
}

/// Publishes a definition under a tree key via the draft lifecycle.
pub fn publish_tree(store: &InMemoryWorkflowStore, tree_key: &str, definition: &TreeDefinition) {
    let tree = store.create_draft_tree(tree_key, tree_key).unwrap();
    let revision = store.save_draft_tree(tree.id, 0, definition).unwrap();
    store.publish_draft_tree(tree.id, revision).unwrap();
}

/// Default execution options for scenario tests.
pub fn options() -> ExecutionOptions {
    ExecutionOptions::new("stub")
}

/// Builds a plain provider event.
pub fn event(event_type: &str, content: Option<&str>) -> ProviderEvent {
    ProviderEvent {
        event_type: event_type.to_string(),
        content: content.map(ToString::to_string),
        metadata: None,
        tokens: None,
    }
}
