//! SQLite-backed [`RunStore`](stepgraph_core::RunStore).
//!
//! Two tables: `graphs` (one row per graph name) and `steps` (the append-only
//! audit log, one row per node execution outcome). Step order within a run is
//! the `steps.id` sequence.

pub mod store;

pub use store::SqliteRunStore;
