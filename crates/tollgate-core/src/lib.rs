//! tollgate-core — shared types for the TollGate admission-control subsystem.
//!
//! TollGate sits inside each database-proxy process and decides, per
//! operation, whether the operation may proceed under the table's and
//! tenant's configured throughput limits. This crate holds the pieces every
//! other TollGate crate depends on:
//!
//! - domain types (`TableLimits`, `TenantLimits`, operation kinds,
//!   consistency levels, resource kinds),
//! - the `tollgate.toml` configuration layer,
//! - the typed error taxonomy (throttling vs. size-limit vs. timeout),
//! - the [`CostAccountant`], which converts an operation into charged
//!   read/write units.

pub mod config;
pub mod cost;
pub mod error;
pub mod types;

pub use config::TollgateConfig;
pub use cost::{CostAccountant, OperationProfile};
pub use error::{AdmissionError, AdmissionResult};
pub use types::*;
