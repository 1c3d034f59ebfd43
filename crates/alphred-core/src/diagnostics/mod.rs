// crates/alphred-core/src/diagnostics/mod.rs
// ============================================================================
// Module: Alphred Diagnostics
// Description: Redaction, event sanitization, and attempt payload assembly.
// Purpose: Persist bounded, secret-free execution diagnostics per attempt.
// Dependencies: crate::diagnostics submodules
// ============================================================================

//! ## Overview
//! Diagnostics flow in two shapes: per-event stream rows written as events
//! arrive, and one schema-v1 payload per attempt written after the phase
//! settles. Both go through the same redaction pass; nothing persisted here
//! may contain credential material.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod events;
pub mod payload;
pub mod redaction;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use events::CONTENT_PREVIEW_CHARS;
pub use events::EventUsage;
pub use events::METADATA_JSON_CHARS;
pub use events::STACK_PREVIEW_CHARS;
pub use events::SanitizedEvent;
pub use events::SanitizedEventRecord;
pub use events::TokenUsage;
pub use events::cap_metadata_json;
pub use events::sanitize_event;
pub use events::stack_preview;
pub use payload::AttemptDiagnostics;
pub use payload::AttemptError;
pub use payload::DIAGNOSTICS_SCHEMA_VERSION;
pub use payload::DiagnosticsPayload;
pub use payload::MAX_DIAGNOSTIC_EVENTS;
pub use payload::MAX_DIAGNOSTICS_PAYLOAD_CHARS;
pub use payload::ToolEventSummary;
pub use payload::build_attempt_diagnostics;
pub use redaction::MAX_METADATA_ARRAY_ENTRIES;
pub use redaction::MAX_METADATA_DEPTH;
pub use redaction::REDACTED;
pub use redaction::is_sensitive_key;
pub use redaction::redact_metadata;
pub use redaction::redact_text;
