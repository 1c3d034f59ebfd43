// crates/alphred-core/src/core/identifiers.rs
// ============================================================================
// Module: Alphred Identifiers
// Description: Canonical opaque identifiers for workflow definitions and runs.
// Purpose: Provide strongly typed, serializable identifiers with stable wire forms.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! This module defines the canonical identifiers used throughout Alphred.
//! Identifiers wrap database rowids and serialize as plain integers on the
//! wire. All numeric identifiers enforce the positive, 1-based invariant at
//! construction boundaries; zero or negative raw values are rejected.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::num::NonZeroI64;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Identifier Macro
// ============================================================================

/// Declares a positive rowid-backed identifier newtype.
macro_rules! rowid_identifier {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        ///
        /// # Invariants
        /// - Always >= 1 (positive, 1-based rowid).
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(NonZeroI64);

        impl $name {
            /// Creates a new identifier from a known non-zero value.
            #[must_use]
            pub const fn new(id: NonZeroI64) -> Self {
                Self(id)
            }

            /// Creates an identifier from a raw rowid (returns `None` unless positive).
            #[must_use]
            pub fn from_raw(raw: i64) -> Option<Self> {
                if raw < 1 {
                    return None;
                }
                NonZeroI64::new(raw).map(Self)
            }

            /// Returns the raw rowid value (always >= 1).
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0.get()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.get().fmt(f)
            }
        }
    };
}

// ============================================================================
// SECTION: Identifier Types
// ============================================================================

rowid_identifier! {
    /// Workflow tree identifier (one row per tree version).
    TreeId
}

rowid_identifier! {
    /// Tree node identifier within a workflow tree version.
    TreeNodeId
}

rowid_identifier! {
    /// Tree edge identifier within a workflow tree version.
    EdgeId
}

rowid_identifier! {
    /// Guard definition identifier.
    GuardId
}

rowid_identifier! {
    /// Prompt template identifier.
    PromptTemplateId
}

rowid_identifier! {
    /// Workflow run identifier.
    RunId
}

rowid_identifier! {
    /// Run node identifier (one row per logical node per run).
    RunNodeId
}

rowid_identifier! {
    /// Phase artifact identifier.
    ArtifactId
}

rowid_identifier! {
    /// Routing decision identifier.
    DecisionId
}

rowid_identifier! {
    /// Run worktree identifier.
    WorktreeId
}

rowid_identifier! {
    /// Repository identifier referenced by run execution contexts.
    RepositoryId
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

    use super::RunId;

    /// Rejects zero and negative raw rowids.
    #[test]
    fn from_raw_rejects_non_positive() {
        assert!(RunId::from_raw(0).is_none());
        assert!(RunId::from_raw(-3).is_none());
        assert_eq!(RunId::from_raw(7).unwrap().get(), 7);
    }

    /// Serializes as a bare integer.
    #[test]
    fn serializes_transparent() {
        let id = RunId::from_raw(42).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "42");
        let back: RunId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
