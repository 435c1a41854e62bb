//! Record types persisted in the TollGate coordination store.
//!
//! These are the messages the fleet exchanges: who is alive, how much each
//! instance consumed last round, and what each instance may spend next
//! round. All types are serializable to/from JSON for storage in redb.

use serde::{Deserialize, Serialize};

use tollgate_core::{InstanceId, ResourceKind, TableId};

/// Registry record for one proxy process in the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    /// Unix timestamp (seconds) of the last heartbeat.
    pub last_heartbeat: u64,
    /// Unix timestamp (seconds) when the instance joined.
    pub started_at: u64,
}

/// One instance's observed demand for a (table, resource) over the last
/// reconciliation round, in units per second.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DemandReport {
    pub table_id: TableId,
    pub resource: ResourceKind,
    pub instance_id: InstanceId,
    /// Units consumed per second since the previous report.
    pub demand_per_sec: f64,
    /// Unix timestamp (seconds) of the report.
    pub epoch: u64,
}

impl DemandReport {
    /// Composite store key: `{table_id}:{resource}:{instance_id}`.
    pub fn table_key(&self) -> String {
        demand_key(&self.table_id, self.resource, &self.instance_id)
    }
}

/// Revised local capacity for one instance, for the next interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllocationRecord {
    pub table_id: TableId,
    pub resource: ResourceKind,
    pub instance_id: InstanceId,
    /// Units per second this instance may admit locally.
    pub capacity_per_sec: f64,
    /// Unused fleet headroom this instance may borrow from when its own
    /// bucket runs dry. Advisory, bounded by the coordinator.
    pub borrowable_per_sec: f64,
    /// Unix timestamp (seconds) of the round that produced this record.
    pub epoch: u64,
}

impl AllocationRecord {
    /// Composite store key: `{table_id}:{resource}:{instance_id}`.
    pub fn table_key(&self) -> String {
        demand_key(&self.table_id, self.resource, &self.instance_id)
    }
}

/// Periodic usage snapshot for one table on one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageSnapshot {
    pub table_id: TableId,
    pub instance_id: InstanceId,
    pub epoch: u64,
    /// Read units charged during the snapshot window.
    pub read_units: u64,
    /// Write units charged during the snapshot window.
    pub write_units: u64,
    /// Operations admitted during the window.
    pub admitted: u64,
    /// Operations that saw at least one throttling denial.
    pub throttled: u64,
    /// Total throttling retries across all operations in the window.
    pub throttle_retries: u64,
}

impl UsageSnapshot {
    /// Composite store key: `{table_id}:{epoch}:{instance_id}`.
    pub fn table_key(&self) -> String {
        format!("{}:{}:{}", self.table_id, self.epoch, self.instance_id)
    }
}

/// Build the composite key for demand and allocation records.
pub fn demand_key(table_id: &str, resource: ResourceKind, instance_id: &str) -> String {
    format!("{table_id}:{}:{instance_id}", resource.as_str())
}
