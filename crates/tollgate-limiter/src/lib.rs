//! tollgate-limiter — the local half of TollGate admission control.
//!
//! Each proxy process holds one [`LimiterRegistry`]: a lazily-populated map
//! of token buckets, one per (table, resource) pair. The bucket is the only
//! state consulted on the hot path; fleet-wide agreement is reconciled
//! asynchronously by the coordinator, which adjusts bucket capacities
//! between rounds.
//!
//! # Architecture
//!
//! ```text
//! ThrottlingPolicy::admit()            ← per operation
//!   └── LimiterRegistry::try_charge()  ← bounded wait, retry once
//!         └── TokenBucket              ← per (table, resource)
//!
//! FleetCoordinator (tollgate-fleet)
//!   ├── LimiterRegistry::take_demand() ← per round
//!   └── LimiterRegistry::set_capacity()
//! ```

pub mod bucket;
pub mod policy;
pub mod registry;

pub use bucket::TokenBucket;
pub use policy::{AdminOp, AdmissionOutcome, RequestOptions, ThrottlingPolicy};
pub use registry::{Admission, LimiterRegistry};
