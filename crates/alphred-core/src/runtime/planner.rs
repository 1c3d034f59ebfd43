// crates/alphred-core/src/runtime/planner.rs
// ============================================================================
// Module: Alphred Run Planner
// Description: Materializes a published workflow tree into a pending run.
// Purpose: Create the run and its initial run-nodes in one transaction.
// Dependencies: crate::{core, interfaces}, thiserror
// ============================================================================

//! ## Overview
//! Planning is intentionally thin: find the latest published version of a
//! tree key, insert a pending run, and insert one pending run-node (attempt
//! 1) per tree node. Everything downstream is the executor's job.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

use crate::core::RunId;
use crate::interfaces::NewRunNode;
use crate::interfaces::StoreError;
use crate::interfaces::WorkflowStore;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Stable domain code for a missing workflow tree.
pub const WORKFLOW_TREE_NOT_FOUND: &str = "WORKFLOW_TREE_NOT_FOUND";

/// Planner errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling; outer adapters translate
///   [`PlanError::TreeNotFound`] to their not-found status.
#[derive(Debug, Error)]
pub enum PlanError {
    /// No published version exists for the tree key.
    #[error("{WORKFLOW_TREE_NOT_FOUND}: no published workflow tree for key {tree_key}")]
    TreeNotFound {
        /// Requested tree key.
        tree_key: String,
    },
    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// SECTION: Planner
// ============================================================================

/// Materializes a run from the latest published version of `tree_key`.
///
/// # Errors
///
/// Returns [`PlanError::TreeNotFound`] when no published version exists and
/// [`PlanError::Store`] when persistence fails.
pub fn materialize_run<S: WorkflowStore>(store: &S, tree_key: &str) -> Result<RunId, PlanError> {
    let tree = store.find_latest_published_tree(tree_key)?.ok_or_else(|| {
        PlanError::TreeNotFound {
            tree_key: tree_key.to_string(),
        }
    })?;
    let nodes: Vec<NewRunNode> = store
        .load_tree_nodes(tree.id)?
        .into_iter()
        .map(|node| NewRunNode {
            tree_node_id: node.id,
            node_key: node.node_key,
            sequence_index: node.sequence_index,
        })
        .collect();
    Ok(store.create_run_with_nodes(tree.id, &nodes)?)
}
