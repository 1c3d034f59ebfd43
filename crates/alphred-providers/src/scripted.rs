// crates/alphred-providers/src/scripted.rs
// ============================================================================
// Module: Alphred Scripted Provider
// Description: Deterministic provider replaying pre-programmed phases.
// Purpose: Drive executor tests and CLI demos without a real agent backend.
// Dependencies: alphred-core, serde_json
// ============================================================================

//! ## Overview
//! Each node key carries a queue of scripted phases. A phase emits its
//! events through the streaming callback and then settles with the scripted
//! success or failure, so tests can rehearse retries, loopbacks, and
//! redaction end to end. Requests are recorded for assertions.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use alphred_core::AgentProvider;
use alphred_core::DecisionSignal;
use alphred_core::PhaseOutput;
use alphred_core::PhaseRequest;
use alphred_core::ProviderError;
use alphred_core::ProviderEvent;
use serde_json::Value;

// ============================================================================
// SECTION: Scripted Phases
// ============================================================================

/// Final result of one scripted phase.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    /// Phase succeeds with this report and routing decision.
    Success {
        /// Report body.
        report: String,
        /// Structured routing decision.
        routing_decision: Option<DecisionSignal>,
        /// Optional decision rationale.
        rationale: Option<String>,
        /// Total tokens attributed to the phase.
        tokens_used: Option<u64>,
        /// Raw result metadata.
        metadata: Option<Value>,
    },
    /// Phase fails with this error.
    Failure {
        /// Stable error name.
        name: String,
        /// Failure reason.
        message: String,
        /// Optional stack rendering.
        stack: Option<String>,
    },
}

/// One scripted phase: streamed events plus a final outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedPhase {
    /// Events replayed through the streaming callback, in order.
    pub events: Vec<ProviderEvent>,
    /// Final phase outcome.
    pub outcome: ScriptedOutcome,
}

impl ScriptedPhase {
    /// Builds a successful phase with a report and routing decision.
    #[must_use]
    pub fn success(report: impl Into<String>, decision: DecisionSignal) -> Self {
        Self {
            events: Vec::new(),
            outcome: ScriptedOutcome::Success {
                report: report.into(),
                routing_decision: Some(decision),
                rationale: None,
                tokens_used: None,
                metadata: None,
            },
        }
    }

    /// Builds a successful phase without a routing decision.
    #[must_use]
    pub fn success_without_decision(report: impl Into<String>) -> Self {
        Self {
            events: Vec::new(),
            outcome: ScriptedOutcome::Success {
                report: report.into(),
                routing_decision: None,
                rationale: None,
                tokens_used: None,
                metadata: None,
            },
        }
    }

    /// Builds a failing phase.
    #[must_use]
    pub fn failure(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            events: Vec::new(),
            outcome: ScriptedOutcome::Failure {
                name: name.into(),
                message: message.into(),
                stack: None,
            },
        }
    }

    /// Attaches streamed events to the phase.
    #[must_use]
    pub fn with_events(mut self, events: Vec<ProviderEvent>) -> Self {
        self.events = events;
        self
    }
}

// ============================================================================
// SECTION: Provider
// ============================================================================

/// Deterministic provider replaying scripted phases per node key.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    /// Scripted phase queues per node key.
    script: Mutex<BTreeMap<String, VecDeque<ScriptedPhase>>>,
    /// Requests observed, in call order.
    requests: Mutex<Vec<PhaseRequest>>,
}

impl ScriptedProvider {
    /// Creates an empty scripted provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a scripted phase for a node key.
    pub fn push_phase(&self, node_key: impl Into<String>, phase: ScriptedPhase) {
        if let Ok(mut script) = self.script.lock() {
            script.entry(node_key.into()).or_default().push_back(phase);
        }
    }

    /// Returns a copy of the requests observed so far.
    #[must_use]
    pub fn requests(&self) -> Vec<PhaseRequest> {
        self.requests.lock().map(|requests| requests.clone()).unwrap_or_default()
    }
}

impl AgentProvider for ScriptedProvider {
    fn run_phase(
        &self,
        request: &PhaseRequest,
        on_event: &mut dyn FnMut(ProviderEvent),
    ) -> Result<PhaseOutput, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let phase = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| {
                script.get_mut(&request.node_key).and_then(VecDeque::pop_front)
            })
            .ok_or_else(|| ProviderError::Phase {
                name: "script_exhausted".to_string(),
                message: format!("no scripted phase left for node {}", request.node_key),
                stack: None,
            })?;
        for event in phase.events {
            on_event(event);
        }
        match phase.outcome {
            ScriptedOutcome::Success {
                report,
                routing_decision,
                rationale,
                tokens_used,
                metadata,
            } => Ok(PhaseOutput {
                report,
                routing_decision,
                rationale,
                tokens_used,
                metadata,
            }),
            ScriptedOutcome::Failure {
                name,
                message,
                stack,
            } => Err(ProviderError::Phase {
                name,
                message,
                stack,
            }),
        }
    }
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

    use alphred_core::AgentProvider;
    use alphred_core::DecisionSignal;
    use alphred_core::ExecutionPermissions;
    use alphred_core::PhaseRequest;
    use alphred_core::ProviderError;
    use alphred_core::ProviderEvent;
    use alphred_core::RunId;

    use super::ScriptedPhase;
    use super::ScriptedProvider;

    /// Builds a minimal phase request for a node key.
    fn request(node_key: &str) -> PhaseRequest {
        PhaseRequest {
            run_id: RunId::from_raw(1).unwrap(),
            node_key: node_key.to_string(),
            attempt: 1,
            prompt: None,
            context_envelopes: Vec::new(),
            permissions: ExecutionPermissions::default(),
            model: None,
            working_directory: None,
        }
    }

    /// Replays events and outcomes in script order, then exhausts.
    #[test]
    fn replays_in_order_then_exhausts() {
        let provider = ScriptedProvider::new();
        provider.push_phase(
            "design",
            ScriptedPhase::success("first", DecisionSignal::Approved).with_events(vec![
                ProviderEvent {
                    event_type: "message".to_string(),
                    content: Some("thinking".to_string()),
                    metadata: None,
                    tokens: Some(5),
                },
            ]),
        );
        provider.push_phase("design", ScriptedPhase::failure("boom", "second call fails"));

        let mut seen = Vec::new();
        let output = provider
            .run_phase(&request("design"), &mut |event| seen.push(event.event_type.clone()))
            .unwrap();
        assert_eq!(output.report, "first");
        assert_eq!(output.routing_decision, Some(DecisionSignal::Approved));
        assert_eq!(seen, vec!["message".to_string()]);

        let failure = provider.run_phase(&request("design"), &mut |_| {});
        assert!(matches!(failure, Err(ProviderError::Phase { name, .. }) if name == "boom"));

        let exhausted = provider.run_phase(&request("design"), &mut |_| {});
        assert!(
            matches!(exhausted, Err(ProviderError::Phase { name, .. }) if name == "script_exhausted")
        );
        assert_eq!(provider.requests().len(), 3);
    }
}
