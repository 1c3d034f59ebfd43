// crates/alphred-core/src/diagnostics/payload.rs
// ============================================================================
// Module: Alphred Attempt Diagnostics Payload
// Description: Per-attempt diagnostics assembly with hard size caps.
// Purpose: Produce the schema-v1 payload persisted once per attempt.
// Dependencies: crate::diagnostics::events, serde, serde_json
// ============================================================================

//! ## Overview
//! Each attempt persists one diagnostics payload derived from the sanitized
//! event stream. The histogram always covers every event; the retained event
//! list and the serialized payload are capped. When the rendering exceeds the
//! payload cap, tail events are dropped one at a time, then the error stack
//! preview goes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::diagnostics::events::SanitizedEvent;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Diagnostics payload schema version.
pub const DIAGNOSTICS_SCHEMA_VERSION: u32 = 1;
/// Maximum sanitized events retained in a payload.
pub const MAX_DIAGNOSTIC_EVENTS: usize = 120;
/// Maximum serialized payload characters.
pub const MAX_DIAGNOSTICS_PAYLOAD_CHARS: usize = 48_000;
/// Maximum characters in a tool-event summary.
const TOOL_SUMMARY_CHARS: usize = 160;

// ============================================================================
// SECTION: Payload Model
// ============================================================================

/// Error details recorded on failed attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptError {
    /// Stable error name.
    pub name: String,
    /// Human-readable failure reason.
    pub message: String,
    /// Redacted, truncated stack rendering.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_preview: Option<String>,
}

/// Compact summary of one tool event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEventSummary {
    /// Zero-based position in the full event stream.
    pub event_index: usize,
    /// Provider event type (`tool_use` or `tool_result`).
    pub event_type: String,
    /// Extracted tool name, when the metadata carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Short summary derived from the event preview.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Schema-v1 attempt diagnostics payload.
///
/// # Invariants
/// - `event_type_counts` covers the FULL stream even when `events` was
///   truncated.
/// - `events[*].event_index` matches the position in the full stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptDiagnostics {
    /// Payload schema version (always 1).
    pub schema_version: u32,
    /// Attempt outcome label (`completed`, `failed`, `retrying`, ...).
    pub outcome: String,
    /// Node status observed when the payload was assembled.
    pub status: String,
    /// Error details for failed attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AttemptError>,
    /// Total events observed in the stream.
    pub event_count_total: usize,
    /// Histogram of event types over the full stream.
    pub event_type_counts: BTreeMap<String, u64>,
    /// Retained sanitized events (capped).
    pub events: Vec<SanitizedEvent>,
    /// Tool-event summaries over the full stream.
    pub tool_events: Vec<ToolEventSummary>,
    /// Final cumulative token total, when any usage was observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cumulative_tokens: Option<u64>,
    /// True when any redaction fired while sanitizing the stream.
    pub redacted: bool,
    /// True when events or previews were dropped to fit caps.
    pub truncated: bool,
}

/// Assembled payload ready for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticsPayload {
    /// The structured payload.
    pub payload: AttemptDiagnostics,
    /// JSON rendering of `payload` (what the store persists).
    pub rendered: Value,
    /// Character count of the rendering.
    pub payload_chars: usize,
    /// Histogram rendered separately for the `counts` column.
    pub counts: Value,
}

// ============================================================================
// SECTION: Assembly
// ============================================================================

/// Builds the attempt diagnostics payload, applying the event-count cap and
/// the serialized-size squeeze.
#[must_use]
pub fn build_attempt_diagnostics(
    outcome: &str,
    status: &str,
    error: Option<AttemptError>,
    events: &[SanitizedEvent],
    redacted: bool,
) -> DiagnosticsPayload {
    let mut event_type_counts: BTreeMap<String, u64> = BTreeMap::new();
    for event in events {
        *event_type_counts.entry(event.event_type.clone()).or_insert(0) += 1;
    }
    let tool_events = events.iter().filter(|event| is_tool_event(event)).map(summarize_tool_event).collect();
    let cumulative_tokens = events.iter().rev().find_map(|event| event.cumulative_tokens);

    let retained: Vec<SanitizedEvent> = events.iter().take(MAX_DIAGNOSTIC_EVENTS).cloned().collect();

    let mut payload = AttemptDiagnostics {
        schema_version: DIAGNOSTICS_SCHEMA_VERSION,
        outcome: outcome.to_string(),
        status: status.to_string(),
        error,
        event_count_total: events.len(),
        event_type_counts,
        events: retained,
        tool_events,
        cumulative_tokens,
        redacted,
        truncated: events.len() > MAX_DIAGNOSTIC_EVENTS,
    };

    // Squeeze to the payload cap: drop tail events one at a time, then the
    // stack preview.
    let (mut rendered, mut payload_chars) = render(&payload);
    while payload_chars > MAX_DIAGNOSTICS_PAYLOAD_CHARS && !payload.events.is_empty() {
        payload.events.pop();
        payload.truncated = true;
        (rendered, payload_chars) = render(&payload);
    }
    if payload_chars > MAX_DIAGNOSTICS_PAYLOAD_CHARS
        && let Some(error) = payload.error.as_mut()
        && error.stack_preview.is_some()
    {
        error.stack_preview = None;
        payload.truncated = true;
        (rendered, payload_chars) = render(&payload);
    }

    let counts = serde_json::to_value(&payload.event_type_counts).unwrap_or(Value::Null);
    DiagnosticsPayload {
        rendered,
        payload_chars,
        counts,
        payload,
    }
}

/// Renders the payload and measures its serialized character count.
fn render(payload: &AttemptDiagnostics) -> (Value, usize) {
    let value = serde_json::to_value(payload).unwrap_or(Value::Null);
    let chars = value.to_string().chars().count();
    (value, chars)
}

/// Returns true for tool lifecycle events.
fn is_tool_event(event: &SanitizedEvent) -> bool {
    event.event_type == "tool_use" || event.event_type == "tool_result"
}

/// Builds the compact summary for one tool event.
fn summarize_tool_event(event: &SanitizedEvent) -> ToolEventSummary {
    let tool_name = event.metadata.as_ref().and_then(|metadata| {
        ["tool_name", "name", "tool"]
            .iter()
            .find_map(|key| metadata.get(key).and_then(Value::as_str))
            .map(ToString::to_string)
    });
    let summary = event.content_preview.as_deref().map(|preview| {
        let (short, _) = crate::context::head_tail_truncate(preview, TOOL_SUMMARY_CHARS);
        short
    });
    ToolEventSummary {
        event_index: event.event_index,
        event_type: event.event_type.clone(),
        tool_name,
        summary,
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

    use serde_json::json;

    use super::AttemptError;
    use super::MAX_DIAGNOSTIC_EVENTS;
    use super::MAX_DIAGNOSTICS_PAYLOAD_CHARS;
    use super::build_attempt_diagnostics;
    use crate::diagnostics::events::SanitizedEvent;

    /// Builds a sanitized event with the given index and preview size.
    fn event(index: usize, event_type: &str, preview_chars: usize) -> SanitizedEvent {
        SanitizedEvent {
            event_index: index,
            event_type: event_type.to_string(),
            content_chars: preview_chars,
            content_preview: (preview_chars > 0).then(|| "p".repeat(preview_chars)),
            metadata: None,
            delta_tokens: None,
            cumulative_tokens: None,
        }
    }

    /// Histogram covers all events even when the retained list is capped.
    #[test]
    fn histogram_covers_full_stream() {
        let events: Vec<_> = (0 .. 150).map(|i| event(i, "message", 10)).collect();
        let built = build_attempt_diagnostics("completed", "completed", None, &events, false);
        assert_eq!(built.payload.event_count_total, 150);
        assert_eq!(built.payload.event_type_counts["message"], 150);
        assert_eq!(built.payload.events.len(), MAX_DIAGNOSTIC_EVENTS);
        assert!(built.payload.truncated);
        // Event indexes still reference the full stream.
        assert_eq!(built.payload.events[119].event_index, 119);
    }

    /// Oversized payloads drop tail events until they fit.
    #[test]
    fn payload_cap_drops_tail_events() {
        let events: Vec<_> = (0 .. 100).map(|i| event(i, "message", 600)).collect();
        let built = build_attempt_diagnostics("completed", "completed", None, &events, false);
        assert!(built.payload_chars <= MAX_DIAGNOSTICS_PAYLOAD_CHARS);
        assert!(built.payload.events.len() < 100);
        assert!(built.payload.truncated);
        assert_eq!(built.payload.event_count_total, 100);
    }

    /// The stack preview is the last thing sacrificed.
    #[test]
    fn stack_preview_dropped_last() {
        let error = AttemptError {
            name: "provider_error".to_string(),
            message: "phase exploded".to_string(),
            stack_preview: Some("frame\n".repeat(8_000)),
        };
        let built = build_attempt_diagnostics("failed", "failed", Some(error), &[], false);
        assert!(built.payload_chars <= MAX_DIAGNOSTICS_PAYLOAD_CHARS);
        let error = built.payload.error.unwrap();
        assert!(error.stack_preview.is_none());
        assert_eq!(error.name, "provider_error");
        assert!(built.payload.truncated);
    }

    /// Tool events are summarized with extracted names.
    #[test]
    fn tool_event_summaries() {
        let mut tool = event(2, "tool_use", 40);
        tool.metadata = Some(json!({"tool_name": "ripgrep"}));
        let events = vec![event(0, "message", 5), event(1, "message", 5), tool];
        let built = build_attempt_diagnostics("completed", "completed", None, &events, false);
        assert_eq!(built.payload.tool_events.len(), 1);
        let summary = &built.payload.tool_events[0];
        assert_eq!(summary.event_index, 2);
        assert_eq!(summary.tool_name.as_deref(), Some("ripgrep"));
        assert!(summary.summary.is_some());
    }

    /// The final cumulative token total comes from the last attributed event.
    #[test]
    fn cumulative_tokens_from_tail() {
        let mut first = event(0, "message", 1);
        first.cumulative_tokens = Some(10);
        let mut second = event(1, "message", 1);
        second.cumulative_tokens = Some(25);
        let built =
            build_attempt_diagnostics("completed", "completed", None, &[first, second], false);
        assert_eq!(built.payload.cumulative_tokens, Some(25));
    }
}
