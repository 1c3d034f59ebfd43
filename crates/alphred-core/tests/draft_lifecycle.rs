// crates/alphred-core/tests/draft_lifecycle.rs
// ============================================================================
// Module: Draft Lifecycle Tests
// Description: Draft revision and publish laws for workflow trees.
// ============================================================================
//! ## Overview
//! Saves bump `draft_revision` by exactly 1 under an expected-revision check;
//! publish requires the expected revision, assigns the next version for the
//! key, and resets the revision to 0.

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

mod support;

use alphred_core::InMemoryWorkflowStore;
use alphred_core::StoreError;
use alphred_core::TreeStatus;
use alphred_core::WorkflowStore;
use support::linear_definition;

// ============================================================================
// SECTION: Revision Laws
// ============================================================================

/// Each accepted save increments the revision by exactly 1.
#[test]
fn saves_increment_revision_by_one() {
    let store = InMemoryWorkflowStore::new();
    let tree = store.create_draft_tree("demo", "Demo").unwrap();
    assert_eq!(tree.draft_revision, 0);
    assert_eq!(tree.status, TreeStatus::Draft);

    let definition = linear_definition(0);
    assert_eq!(store.save_draft_tree(tree.id, 0, &definition).unwrap(), 1);
    assert_eq!(store.save_draft_tree(tree.id, 1, &definition).unwrap(), 2);
    assert_eq!(store.load_tree(tree.id).unwrap().unwrap().draft_revision, 2);
}

/// A save against a stale revision is a conflict and changes nothing.
#[test]
fn stale_save_conflicts() {
    let store = InMemoryWorkflowStore::new();
    let tree = store.create_draft_tree("demo", "Demo").unwrap();
    let definition = linear_definition(0);
    store.save_draft_tree(tree.id, 0, &definition).unwrap();

    let stale = store.save_draft_tree(tree.id, 0, &definition);
    assert!(matches!(stale, Err(StoreError::Conflict(_))));
    assert_eq!(store.load_tree(tree.id).unwrap().unwrap().draft_revision, 1);
}

/// Publish checks the revision, assigns the next version, and resets the
/// revision to 0.
#[test]
fn publish_assigns_version_and_resets_revision() {
    let store = InMemoryWorkflowStore::new();
    let definition = linear_definition(0);

    let first = store.create_draft_tree("demo", "Demo").unwrap();
    store.save_draft_tree(first.id, 0, &definition).unwrap();
    assert!(matches!(
        store.publish_draft_tree(first.id, 0),
        Err(StoreError::Conflict(_))
    ));
    assert_eq!(store.publish_draft_tree(first.id, 1).unwrap(), 1);
    let published = store.load_tree(first.id).unwrap().unwrap();
    assert_eq!(published.status, TreeStatus::Published);
    assert_eq!(published.draft_revision, 0);
    assert_eq!(published.version, 1);

    // A second draft for the same key publishes as version 2 and becomes the
    // latest published tree.
    let second = store.create_draft_tree("demo", "Demo v2").unwrap();
    store.save_draft_tree(second.id, 0, &definition).unwrap();
    assert_eq!(store.publish_draft_tree(second.id, 1).unwrap(), 2);
    let latest = store.find_latest_published_tree("demo").unwrap().unwrap();
    assert_eq!(latest.id, second.id);
    assert_eq!(latest.version, 2);
}

/// Only one live draft may exist per tree key.
#[test]
fn duplicate_draft_bootstrap_conflicts() {
    let store = InMemoryWorkflowStore::new();
    store.create_draft_tree("demo", "Demo").unwrap();
    assert!(matches!(
        store.create_draft_tree("demo", "Demo again"),
        Err(StoreError::Conflict(_))
    ));
}

/// Malformed definitions are rejected before anything is replaced.
#[test]
fn invalid_definitions_are_rejected() {
    let store = InMemoryWorkflowStore::new();
    let tree = store.create_draft_tree("demo", "Demo").unwrap();

    let mut duplicate_keys = linear_definition(0);
    duplicate_keys.nodes.push(support::agent_node("design", 9, 0));
    assert!(matches!(
        store.save_draft_tree(tree.id, 0, &duplicate_keys),
        Err(StoreError::Invalid(_))
    ));

    let mut dangling_edge = linear_definition(0);
    dangling_edge.edges.push(support::auto_edge("review", "missing", 0));
    assert!(matches!(
        store.save_draft_tree(tree.id, 0, &dangling_edge),
        Err(StoreError::Invalid(_))
    ));

    let mut duplicate_priority = linear_definition(0);
    duplicate_priority.edges.push(support::auto_edge("design", "review", 0));
    assert!(matches!(
        store.save_draft_tree(tree.id, 0, &duplicate_priority),
        Err(StoreError::Invalid(_))
    ));

    // The revision was never bumped.
    assert_eq!(store.load_tree(tree.id).unwrap().unwrap().draft_revision, 0);
}
