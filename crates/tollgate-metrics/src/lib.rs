//! tollgate-metrics — observability for TollGate admission control.
//!
//! Tracks per-table charged units, admissions, throttle events, and retry
//! counts, persists periodic snapshots to the coordination store, and
//! provides Prometheus-compatible text exposition.
//!
//! # Architecture
//!
//! ```text
//! UsageCollector
//!   ├── record_admission() ← called per admitted operation
//!   ├── record_throttled() ← called when an operation gives up throttled
//!   ├── snapshot() → persists UsageSnapshot to CoordStore
//!   └── run() → periodic snapshot loop
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::UsageCollector;
pub use prometheus::render_prometheus;
