//! tollgate-state — coordination store for the TollGate fleet.
//!
//! Backed by [redb](https://docs.rs/redb). Proxy instances share no memory;
//! the only thing they share is this store. Each instance writes its own
//! demand reports and heartbeats here, and the fleet coordinator reads
//! everyone's reports back to compute per-instance allocations.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{table_id}:{resource}:{instance_id}`) enable prefix
//! scans for all reports concerning one table.
//!
//! The `CoordStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::CoordStore;
pub use types::*;
