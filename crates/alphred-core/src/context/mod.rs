// crates/alphred-core/src/context/mod.rs
// ============================================================================
// Module: Alphred Context Handoff
// Description: Upstream-artifact envelopes, budgets, and assembly manifests.
// Purpose: Marshal predecessor reports into strict untrusted-data envelopes.
// Dependencies: crate::core::{hashing, identifiers, run, time}, serde
// ============================================================================

//! ## Overview
//! Before each agent attempt the executor collects the latest report artifact
//! from every direct predecessor and serializes each into a fixed-format
//! envelope marked `untrusted_data: true`. A per-attempt manifest records
//! exactly what was included, truncated, and dropped so the handoff is
//! auditable. Budgets are hard caps; the digest always covers the FULL
//! original content, never the truncated body.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::hashing::sha256_hex;
use crate::core::identifiers::ArtifactId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::RunNodeId;
use crate::core::run::PhaseArtifact;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Context policy version stamped into every envelope and manifest.
pub const CONTEXT_POLICY_VERSION: u32 = 1;
/// Maximum characters included from a single artifact.
pub const MAX_CONTEXT_CHARS_PER_ARTIFACT: usize = 12_000;
/// Maximum characters included across all envelopes of one attempt.
pub const MAX_CONTEXT_CHARS_TOTAL: usize = 32_000;
/// Minimum remaining budget required before a final partial inclusion.
pub const MIN_CONTEXT_CHARS_REMAINING: usize = 1_000;
/// Maximum number of artifacts included per attempt.
pub const MAX_CONTEXT_ARTIFACTS: usize = 4;
/// Opening body delimiter inside an envelope.
const BODY_BEGIN: &str = "<<<BEGIN>>>";
/// Closing body delimiter inside an envelope.
const BODY_END: &str = "<<<END>>>";

// ============================================================================
// SECTION: Truncation
// ============================================================================

/// Truncation record embedded in envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationInfo {
    /// True when characters were dropped.
    pub applied: bool,
    /// Truncation method label (`none` or `head_tail`).
    pub method: String,
    /// Character count of the full original content.
    pub original_chars: usize,
    /// Character count of the included body.
    pub included_chars: usize,
    /// Character count removed from the middle.
    pub dropped_chars: usize,
}

/// Head-tail truncates `content` to at most `limit` characters.
///
/// The head keeps `limit / 2` characters and the tail keeps the remainder, so
/// the included length is exactly `min(limit, original)`. Character counts
/// are Unicode scalar values.
#[must_use]
pub fn head_tail_truncate(content: &str, limit: usize) -> (String, TruncationInfo) {
    let original_chars = content.chars().count();
    if original_chars <= limit {
        return (
            content.to_string(),
            TruncationInfo {
                applied: false,
                method: "none".to_string(),
                original_chars,
                included_chars: original_chars,
                dropped_chars: 0,
            },
        );
    }
    let head_chars = limit / 2;
    let tail_chars = limit - head_chars;
    let mut body = String::with_capacity(content.len().min(limit * 4));
    body.extend(content.chars().take(head_chars));
    body.extend(content.chars().skip(original_chars - tail_chars));
    (
        body,
        TruncationInfo {
            applied: true,
            method: "head_tail".to_string(),
            original_chars,
            included_chars: limit,
            dropped_chars: original_chars - limit,
        },
    )
}

// ============================================================================
// SECTION: Assembly Inputs
// ============================================================================

/// One predecessor report considered for inclusion.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextCandidate {
    /// Node key of the producing predecessor.
    pub source_node_key: String,
    /// Run-node id of the producing predecessor.
    pub source_run_node_id: RunNodeId,
    /// Attempt that produced the artifact.
    pub source_attempt: i64,
    /// The latest report artifact of the predecessor.
    pub artifact: PhaseArtifact,
}

// ============================================================================
// SECTION: Manifest
// ============================================================================

/// Per-attempt record of the context assembly.
///
/// # Invariants
/// - Vectors are ordered by inclusion order (candidate source order).
/// - `missing_upstream_artifacts` is true exactly when nothing was included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextManifest {
    /// Context policy version (always 1).
    pub context_policy_version: u32,
    /// Identifiers of included artifacts, in order.
    pub included_artifact_ids: Vec<ArtifactId>,
    /// Node keys of included sources, in order.
    pub included_source_node_keys: Vec<String>,
    /// Run-node ids of included sources, in order.
    pub included_source_run_node_ids: Vec<RunNodeId>,
    /// Number of included artifacts.
    pub included_count: usize,
    /// Total characters included across all envelopes.
    pub included_chars_total: usize,
    /// Identifiers of artifacts that were truncated to fit.
    pub truncated_artifact_ids: Vec<ArtifactId>,
    /// True when no upstream artifact was included at all.
    pub missing_upstream_artifacts: bool,
    /// Assembly wall-clock timestamp (RFC3339 UTC).
    pub assembly_timestamp: String,
    /// True when predecessors produced only non-report artifacts.
    pub no_eligible_artifact_types: bool,
    /// True when candidates were dropped for budget reasons.
    pub budget_overflow: bool,
    /// Identifiers of artifacts dropped by the budget.
    pub dropped_artifact_ids: Vec<ArtifactId>,
}

// ============================================================================
// SECTION: Assembly
// ============================================================================

/// Result of assembling context for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextAssembly {
    /// Rendered envelopes, one per included artifact, in order.
    pub envelopes: Vec<String>,
    /// Manifest describing the assembly.
    pub manifest: ContextManifest,
}

/// Assembles envelopes and a manifest from predecessor report candidates.
///
/// Candidates must already be in source order. `no_eligible_artifact_types`
/// is supplied by the caller, which knows whether predecessors produced only
/// non-report artifacts.
#[must_use]
pub fn assemble_context(
    run_id: RunId,
    target_node_key: &str,
    candidates: &[ContextCandidate],
    no_eligible_artifact_types: bool,
    assembled_at: Timestamp,
) -> ContextAssembly {
    let mut envelopes = Vec::new();
    let mut included_artifact_ids = Vec::new();
    let mut included_source_node_keys = Vec::new();
    let mut included_source_run_node_ids = Vec::new();
    let mut truncated_artifact_ids = Vec::new();
    let mut dropped_artifact_ids = Vec::new();
    let mut included_chars_total = 0_usize;
    let mut budget_overflow = false;

    for candidate in candidates {
        if included_artifact_ids.len() >= MAX_CONTEXT_ARTIFACTS {
            budget_overflow = true;
            dropped_artifact_ids.push(candidate.artifact.id);
            continue;
        }
        let remaining = MAX_CONTEXT_CHARS_TOTAL.saturating_sub(included_chars_total);
        let limit = MAX_CONTEXT_CHARS_PER_ARTIFACT.min(remaining);
        let original_chars = candidate.artifact.content.chars().count();
        if original_chars > limit && remaining < MIN_CONTEXT_CHARS_REMAINING {
            budget_overflow = true;
            dropped_artifact_ids.push(candidate.artifact.id);
            continue;
        }
        let (body, truncation) = head_tail_truncate(&candidate.artifact.content, limit);
        if truncation.applied {
            truncated_artifact_ids.push(candidate.artifact.id);
        }
        included_chars_total += truncation.included_chars;
        included_artifact_ids.push(candidate.artifact.id);
        included_source_node_keys.push(candidate.source_node_key.clone());
        included_source_run_node_ids.push(candidate.source_run_node_id);
        envelopes.push(render_envelope(run_id, target_node_key, candidate, &body, &truncation));
    }

    let included_count = included_artifact_ids.len();
    ContextAssembly {
        envelopes,
        manifest: ContextManifest {
            context_policy_version: CONTEXT_POLICY_VERSION,
            included_artifact_ids,
            included_source_node_keys,
            included_source_run_node_ids,
            included_count,
            included_chars_total,
            truncated_artifact_ids,
            missing_upstream_artifacts: included_count == 0,
            assembly_timestamp: assembled_at.to_rfc3339(),
            no_eligible_artifact_types,
            budget_overflow,
            dropped_artifact_ids,
        },
    }
}

/// Renders the fixed-format untrusted-data envelope for one artifact.
fn render_envelope(
    run_id: RunId,
    target_node_key: &str,
    candidate: &ContextCandidate,
    body: &str,
    truncation: &TruncationInfo,
) -> String {
    let artifact = &candidate.artifact;
    let sha256 = sha256_hex(&artifact.content);
    format!(
        "ALPHRED_UPSTREAM_ARTIFACT v1\n\
         policy_version: {CONTEXT_POLICY_VERSION}\n\
         untrusted_data: true\n\
         workflow_run_id: {run_id}\n\
         target_node_key: {target_node_key}\n\
         source_node_key: {source_node_key}\n\
         source_run_node_id: {source_run_node_id}\n\
         source_attempt: {source_attempt}\n\
         artifact_id: {artifact_id}\n\
         artifact_type: {artifact_type}\n\
         content_type: {content_type}\n\
         created_at: {created_at}\n\
         sha256: {sha256}\n\
         truncation:\n\
         \x20 applied: {applied}\n\
         \x20 method: {method}\n\
         \x20 original_chars: {original_chars}\n\
         \x20 included_chars: {included_chars}\n\
         \x20 dropped_chars: {dropped_chars}\n\
         content:\n\
         {BODY_BEGIN}\n\
         {body}\n\
         {BODY_END}",
        source_node_key = candidate.source_node_key,
        source_run_node_id = candidate.source_run_node_id,
        source_attempt = candidate.source_attempt,
        artifact_id = artifact.id,
        artifact_type = artifact.artifact_type.as_str(),
        content_type = artifact.content_type.as_str(),
        created_at = artifact.created_at.to_rfc3339(),
        applied = truncation.applied,
        method = truncation.method,
        original_chars = truncation.original_chars,
        included_chars = truncation.included_chars,
        dropped_chars = truncation.dropped_chars,
    )
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

    use super::ContextCandidate;
    use super::MAX_CONTEXT_CHARS_PER_ARTIFACT;
    use super::assemble_context;
    use super::head_tail_truncate;
    use crate::core::hashing::sha256_hex;
    use crate::core::identifiers::ArtifactId;
    use crate::core::identifiers::RunId;
    use crate::core::identifiers::RunNodeId;
    use crate::core::run::ArtifactType;
    use crate::core::run::ContentType;
    use crate::core::run::PhaseArtifact;
    use crate::core::time::Timestamp;

    /// Builds a report candidate with the given id and content.
    fn candidate(id: i64, node_key: &str, content: String) -> ContextCandidate {
        ContextCandidate {
            source_node_key: node_key.to_string(),
            source_run_node_id: RunNodeId::from_raw(id).unwrap(),
            source_attempt: 1,
            artifact: PhaseArtifact {
                id: ArtifactId::from_raw(id).unwrap(),
                run_id: RunId::from_raw(1).unwrap(),
                run_node_id: RunNodeId::from_raw(id).unwrap(),
                artifact_type: ArtifactType::Report,
                content_type: ContentType::Markdown,
                content,
                metadata: json!({}),
                created_at: Timestamp::from_unix_millis(1_700_000_000_000),
            },
        }
    }

    /// Splits exactly floor(limit/2) head and limit-head tail characters.
    #[test]
    fn head_tail_split_is_exact() {
        let content: String = ('a' ..= 'z').cycle().take(101).collect();
        let (body, info) = head_tail_truncate(&content, 21);
        assert!(info.applied);
        assert_eq!(info.method, "head_tail");
        assert_eq!(info.original_chars, 101);
        assert_eq!(info.included_chars, 21);
        assert_eq!(info.dropped_chars, 80);
        assert_eq!(body.chars().count(), 21);
        let head: String = content.chars().take(10).collect();
        let tail: String = content.chars().skip(101 - 11).collect();
        assert_eq!(body, format!("{head}{tail}"));
    }

    /// Short content passes through untouched.
    #[test]
    fn short_content_is_not_truncated() {
        let (body, info) = head_tail_truncate("short", 100);
        assert_eq!(body, "short");
        assert!(!info.applied);
        assert_eq!(info.method, "none");
        assert_eq!(info.dropped_chars, 0);
    }

    /// Spec scenario S6: a 20,000-char artifact truncates to 12,000 with the
    /// digest covering the original content.
    #[test]
    fn oversized_artifact_envelope() {
        let content = "x".repeat(20_000);
        let run_id = RunId::from_raw(1).unwrap();
        let sources = vec![candidate(5, "design", content.clone())];
        let assembly = assemble_context(
            run_id,
            "implement",
            &sources,
            false,
            Timestamp::from_unix_millis(1_700_000_000_000),
        );
        assert_eq!(assembly.envelopes.len(), 1);
        let envelope = &assembly.envelopes[0];
        assert!(envelope.starts_with("ALPHRED_UPSTREAM_ARTIFACT v1\n"));
        assert!(envelope.contains("untrusted_data: true\n"));
        assert!(envelope.contains("  applied: true\n"));
        assert!(envelope.contains("  method: head_tail\n"));
        assert!(envelope.contains(&format!("  included_chars: {MAX_CONTEXT_CHARS_PER_ARTIFACT}\n")));
        assert!(envelope.contains("  dropped_chars: 8000\n"));
        assert!(envelope.contains(&format!("sha256: {}\n", sha256_hex(&content))));
        assert!(envelope.contains("<<<BEGIN>>>\n"));
        assert!(envelope.ends_with("<<<END>>>"));
        let manifest = &assembly.manifest;
        assert_eq!(manifest.truncated_artifact_ids, vec![ArtifactId::from_raw(5).unwrap()]);
        assert_eq!(manifest.included_chars_total, MAX_CONTEXT_CHARS_PER_ARTIFACT);
        assert!(!manifest.missing_upstream_artifacts);
        assert!(!manifest.budget_overflow);
    }

    /// At most four artifacts are included; the rest are dropped.
    #[test]
    fn artifact_count_cap() {
        let run_id = RunId::from_raw(1).unwrap();
        let sources: Vec<_> =
            (1 ..= 6).map(|id| candidate(id, &format!("node-{id}"), "body".to_string())).collect();
        let assembly = assemble_context(
            run_id,
            "join",
            &sources,
            false,
            Timestamp::from_unix_millis(0),
        );
        assert_eq!(assembly.envelopes.len(), 4);
        assert_eq!(assembly.manifest.included_count, 4);
        assert!(assembly.manifest.budget_overflow);
        assert_eq!(
            assembly.manifest.dropped_artifact_ids,
            vec![ArtifactId::from_raw(5).unwrap(), ArtifactId::from_raw(6).unwrap()]
        );
    }

    /// A candidate needing a partial include under the 1,000-char floor is
    /// dropped with `budget_overflow`.
    #[test]
    fn global_budget_floor() {
        let run_id = RunId::from_raw(1).unwrap();
        let sources = vec![
            candidate(1, "a", "x".repeat(12_000)),
            candidate(2, "b", "x".repeat(12_000)),
            candidate(3, "c", "x".repeat(7_600)),
            candidate(4, "d", "x".repeat(5_000)),
        ];
        let assembly = assemble_context(
            run_id,
            "join",
            &sources,
            false,
            Timestamp::from_unix_millis(0),
        );
        // 12,000 + 12,000 + 7,600 leaves 400 remaining: below the floor, so
        // the final candidate is dropped rather than sliced.
        assert_eq!(assembly.envelopes.len(), 3);
        assert_eq!(assembly.manifest.included_chars_total, 31_600);
        assert!(assembly.manifest.budget_overflow);
        assert_eq!(assembly.manifest.dropped_artifact_ids, vec![ArtifactId::from_raw(4).unwrap()]);
        assert!(assembly.manifest.truncated_artifact_ids.is_empty());
    }

    /// An empty candidate list produces an empty manifest with the missing
    /// flag set.
    #[test]
    fn missing_upstream_artifacts_flag() {
        let run_id = RunId::from_raw(1).unwrap();
        let assembly =
            assemble_context(run_id, "design", &[], true, Timestamp::from_unix_millis(0));
        assert!(assembly.envelopes.is_empty());
        assert!(assembly.manifest.missing_upstream_artifacts);
        assert!(assembly.manifest.no_eligible_artifact_types);
        assert_eq!(assembly.manifest.included_count, 0);
        assert_eq!(assembly.manifest.context_policy_version, 1);
    }
}
