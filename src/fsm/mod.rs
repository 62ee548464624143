//! Persistent finite-state-machine store.
//!
//! Models the target application as a directed graph: nodes are deduplicated
//! page states, edges are UI actions. The same SQLite file also persists
//! sessions, observations, hypotheses, and probe results, so a completed
//! session can be re-opened for export or inspection.
//!
//! ## Example
//!
//! ```rust,ignore
//! use apiscope_core::fsm::FsmStore;
//! use apiscope_core::statehash::StateHash;
//!
//! let store = FsmStore::in_memory()?;
//! store.create_session("sess-1", "https://example.com", &serde_json::json!({}))?;
//! let is_new = store.add_state(StateHash(42), "sess-1", "https://example.com", "Home", None)?;
//! assert!(is_new);
//! ```

mod schema;
mod store;

pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use store::{
    FsmGraph, FsmStore, GraphEdge, GraphNode, PageStateRow, SessionRow, TransitionRow,
};
