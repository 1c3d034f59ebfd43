// crates/alphred-store-sqlite/src/lib.rs
// ============================================================================
// Module: Alphred SQLite Store Library
// Description: Durable WorkflowStore backed by SQLite.
// Purpose: Expose the SQLite store, its configuration, and session factory.
// Dependencies: crate::store
// ============================================================================

//! ## Overview
//! This crate persists the entire workflow data model in one `SQLite`
//! database. Guarded updates implement the core's optimistic-concurrency
//! contract; multi-row invariants (planning, retry requeue, draft saves) run
//! in transactions.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use store::SqliteJournalMode;
pub use store::SqliteSessionFactory;
pub use store::SqliteStoreConfig;
pub use store::SqliteSyncMode;
pub use store::SqliteWorkflowStore;
