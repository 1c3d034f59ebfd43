// crates/alphred-core/src/lib.rs
// ============================================================================
// Module: Alphred Core Library
// Description: Public API surface for the Alphred workflow-orchestrator core.
// Purpose: Expose the domain model, interfaces, and runtime machinery.
// Dependencies: crate::{context, core, diagnostics, graph, interfaces, runtime}
// ============================================================================

//! ## Overview
//! Alphred core is a durable, SQL-backed workflow execution engine: it
//! materializes versioned workflow trees into runs, advances them one node at
//! a time under row-level optimistic concurrency, hands upstream artifacts to
//! agents as untrusted-data envelopes, and persists redacted diagnostics for
//! every attempt. The core is backend-agnostic and integrates through
//! explicit interfaces rather than embedding into agent frameworks.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod context;
pub mod core;
pub mod diagnostics;
pub mod graph;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use crate::core::*;

pub use context::CONTEXT_POLICY_VERSION;
pub use context::ContextAssembly;
pub use context::ContextCandidate;
pub use context::ContextManifest;
pub use context::MAX_CONTEXT_ARTIFACTS;
pub use context::MAX_CONTEXT_CHARS_PER_ARTIFACT;
pub use context::MAX_CONTEXT_CHARS_TOTAL;
pub use context::MIN_CONTEXT_CHARS_REMAINING;
pub use context::TruncationInfo;
pub use context::assemble_context;
pub use context::head_tail_truncate;
pub use interfaces::AgentProvider;
pub use interfaces::LatestArtifact;
pub use interfaces::NewArtifact;
pub use interfaces::NewDiagnostics;
pub use interfaces::NewPromptTemplate;
pub use interfaces::NewRoutingDecision;
pub use interfaces::NewRunNode;
pub use interfaces::NewStreamEvent;
pub use interfaces::NewTreeEdge;
pub use interfaces::NewTreeNode;
pub use interfaces::NodeTransition;
pub use interfaces::PhaseOutput;
pub use interfaces::PhaseRequest;
pub use interfaces::ProviderError;
pub use interfaces::ProviderEvent;
pub use interfaces::ProviderResolver;
pub use interfaces::StoreError;
pub use interfaces::StoreSessionFactory;
pub use interfaces::TimestampAction;
pub use interfaces::TreeDefinition;
pub use interfaces::WorkflowStore;
pub use runtime::ControlError;
pub use runtime::ControlOutcome;
pub use runtime::DEFAULT_MAX_RUN_STEPS;
pub use runtime::ExecutionOptions;
pub use runtime::ExecutorError;
pub use runtime::InMemorySessionFactory;
pub use runtime::InMemoryWorkflowStore;
pub use runtime::MAX_CONTROL_PRECONDITION_RETRIES;
pub use runtime::PlanError;
pub use runtime::RunControlAction;
pub use runtime::RunControlResult;
pub use runtime::RunResult;
pub use runtime::StepOutcome;
pub use runtime::WORKFLOW_TREE_NOT_FOUND;
pub use runtime::WorkflowExecutor;
pub use runtime::control_run;
pub use runtime::materialize_run;
