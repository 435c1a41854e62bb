//! tollgate-fleet — fleet-wide budget reconciliation.
//!
//! Proxy instances share no memory and no clock; the only agreement point
//! is the coordination store. Each instance periodically publishes how much
//! it actually consumed per (table, resource), reads everyone else's
//! reports, and recomputes its own local allocation proportional to demand,
//! with a minimum floor so an idle or newly-joined instance is never
//! starved to zero.
//!
//! The local bucket is the only state trusted on the hot path; this crate
//! just refreshes it between rounds. If the store is unreachable, each
//! instance degrades to an equal static share of the last known limits
//! rather than failing requests.

pub mod allocation;
pub mod coordinator;

pub use allocation::{borrowable_share, proportional_share};
pub use coordinator::{FleetCoordinator, ReconcileStats};
