// crates/alphred-core/tests/context_props.rs
// ============================================================================
// Module: Context Property Tests
// Description: Property-based checks for truncation and redaction bounds.
// ============================================================================
//! ## Overview
//! Randomized inputs confirm the head-tail truncation accounting identities
//! and that secret-shaped strings never survive redaction.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use alphred_core::diagnostics::redact_text;
use alphred_core::head_tail_truncate;
use proptest::prelude::*;

proptest! {
    /// Included chars are exactly `min(limit, original)` and the body is the
    /// head prefix plus the tail suffix of the original.
    #[test]
    fn truncation_accounting_identities(
        content in proptest::collection::vec(any::<char>(), 0 .. 400),
        limit in 1_usize .. 200,
    ) {
        let content: String = content.into_iter().collect();
        let original_chars = content.chars().count();
        let (body, info) = head_tail_truncate(&content, limit);

        prop_assert_eq!(info.original_chars, original_chars);
        prop_assert_eq!(info.included_chars, original_chars.min(limit));
        prop_assert_eq!(info.included_chars + info.dropped_chars, original_chars);
        prop_assert_eq!(body.chars().count(), info.included_chars);
        prop_assert_eq!(info.applied, original_chars > limit);

        if info.applied {
            let head_chars = limit / 2;
            let head: String = content.chars().take(head_chars).collect();
            let tail: String =
                content.chars().skip(original_chars - (limit - head_chars)).collect();
            prop_assert_eq!(body, format!("{head}{tail}"));
        } else {
            prop_assert_eq!(body, content);
        }
    }

    /// Strings embedding a generated GitHub-style token never survive
    /// redaction intact.
    #[test]
    fn secret_shapes_never_survive(
        prefix in "[a-z ]{0,19} ",
        token in "ghp_[A-Za-z0-9]{36}",
        suffix in " [a-z ]{0,19}",
    ) {
        let leaky = format!("{prefix}{token}{suffix}");
        let (scrubbed, redacted) = redact_text(&leaky);
        prop_assert!(redacted);
        prop_assert!(!scrubbed.contains(&token));
    }
}
