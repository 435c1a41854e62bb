//! Domain types for TollGate admission control.
//!
//! These types cross crate boundaries: the limiter, fleet coordinator,
//! abuse tracker, and metrics collector all speak in terms of tables,
//! tenants, resource kinds, and charges. Limits records are owned by the
//! external table-metadata service; TollGate holds reconciled copies only.

use serde::{Deserialize, Serialize};

/// Unique identifier for a table (tenant-scoped).
pub type TableId = String;

/// Unique identifier for a tenant.
pub type TenantId = String;

/// Unique identifier for one proxy process in the fleet.
pub type InstanceId = String;

/// Identity of a client connection / request origin, as reported by the
/// protocol decoder (e.g. connection key or authenticated principal).
pub type ClientId = String;

// ── Operations ─────────────────────────────────────────────────────

/// Kind of data operation being admitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Get,
    Query,
    Put,
    Delete,
    /// Table-level DDL; charged against the tenant's operation rate,
    /// not the table's throughput units.
    Ddl,
}

impl OperationKind {
    /// The resource kind this operation primarily consumes.
    pub fn dominant_resource(self) -> ResourceKind {
        match self {
            OperationKind::Get | OperationKind::Query => ResourceKind::Read,
            OperationKind::Put | OperationKind::Delete | OperationKind::Ddl => {
                ResourceKind::Write
            }
        }
    }
}

/// Read consistency requested by the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    #[default]
    Eventual,
    /// Strongly-consistent read; charged at a multiple of eventual.
    Absolute,
}

/// The two throughput resources a table budget is split into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Read,
    Write,
}

impl ResourceKind {
    /// Stable short name, used in composite store keys and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Read => "read",
            ResourceKind::Write => "write",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Limits (owned by the metadata service) ─────────────────────────

/// Capacity mode for a table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapacityMode {
    #[default]
    Provisioned,
    OnDemand,
}

/// Per-table throughput and storage limits.
///
/// Supplied by the table-metadata service; mutated externally via DDL and
/// reconciled into limiter state on change. Never authoritative here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableLimits {
    pub table_id: TableId,
    pub tenant_id: TenantId,
    /// Read units per second across the whole fleet.
    pub read_units_per_sec: u32,
    /// Write units per second across the whole fleet.
    pub write_units_per_sec: u32,
    /// Storage ceiling in GB.
    pub storage_gb: u32,
    pub mode: CapacityMode,
}

impl TableLimits {
    /// Fleet-wide capacity for one resource kind, in units per second.
    pub fn capacity(&self, resource: ResourceKind) -> u32 {
        match resource {
            ResourceKind::Read => self.read_units_per_sec,
            ResourceKind::Write => self.write_units_per_sec,
        }
    }
}

/// Aggregate ceilings across all tables owned by one tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantLimits {
    pub tenant_id: TenantId,
    /// Aggregate read units per second across the tenant's tables.
    pub tenant_read_units: u32,
    /// Aggregate write units per second across the tenant's tables.
    pub tenant_write_units: u32,
    /// Aggregate storage ceiling in GB.
    pub tenant_size_gb: u32,
    /// DDL requests allowed per minute.
    pub ddl_requests_per_min: u32,
    /// Table limit reductions allowed per day.
    pub table_limit_reductions_per_day: u32,
    /// Billing mode changes allowed per day.
    pub billing_mode_changes_per_day: u32,
}

// ── Charges ────────────────────────────────────────────────────────

/// Units charged for one operation, attached to every response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Charge {
    pub read_units: u32,
    pub write_units: u32,
}

impl Charge {
    pub fn read(units: u32) -> Self {
        Self { read_units: units, write_units: 0 }
    }

    pub fn write(units: u32) -> Self {
        Self { read_units: 0, write_units: units }
    }

    /// Units charged against one resource kind.
    pub fn units(&self, resource: ResourceKind) -> u32 {
        match resource {
            ResourceKind::Read => self.read_units,
            ResourceKind::Write => self.write_units,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.read_units == 0 && self.write_units == 0
    }
}

impl std::ops::Add for Charge {
    type Output = Charge;

    fn add(self, rhs: Charge) -> Charge {
        Charge {
            read_units: self.read_units.saturating_add(rhs.read_units),
            write_units: self.write_units.saturating_add(rhs.write_units),
        }
    }
}
