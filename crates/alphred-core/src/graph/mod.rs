// crates/alphred-core/src/graph/mod.rs
// ============================================================================
// Module: Alphred Graph Analysis
// Description: Projections, routing selection, and schedule analysis.
// Purpose: Turn raw run rows into the deterministic views the executor scans.
// Dependencies: crate::graph submodules
// ============================================================================

//! ## Overview
//! Everything in this module is a pure function over loaded rows: the
//! executor loads a snapshot, projects it, and only then mutates the store
//! through guarded transitions. Determinism here is what makes concurrent
//! steps converge instead of fight.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod projections;
pub mod routing;
pub mod schedule;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use projections::latest_artifacts_map;
pub use projections::latest_decisions_map;
pub use projections::latest_run_node_attempts;
pub use routing::NoRouteFinding;
pub use routing::RoutingInputs;
pub use routing::RoutingProjection;
pub use routing::decision_applies;
pub use routing::has_live_successor;
pub use routing::match_outgoing_edge;
pub use routing::ordered_success_edges;
pub use routing::select_routes;
pub use schedule::ClaimKind;
pub use schedule::NextRunnable;
pub use schedule::compute_unreachable_pending;
pub use schedule::find_next_runnable;
