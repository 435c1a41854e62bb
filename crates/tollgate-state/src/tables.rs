//! redb table definitions for the TollGate coordination store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).
//! Composite keys follow the pattern `{table_id}:{resource}:{instance_id}`
//! so one prefix scan collects every instance's record for a table.

use redb::TableDefinition;

/// Reconciled copies of `TableLimits` keyed by `{table_id}`.
pub const TABLE_LIMITS: TableDefinition<&str, &[u8]> = TableDefinition::new("table_limits");

/// Reconciled copies of `TenantLimits` keyed by `{tenant_id}`.
pub const TENANT_LIMITS: TableDefinition<&str, &[u8]> = TableDefinition::new("tenant_limits");

/// Instance registry keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Demand reports keyed by `{table_id}:{resource}:{instance_id}`.
pub const DEMAND: TableDefinition<&str, &[u8]> = TableDefinition::new("demand");

/// Fleet allocations keyed by `{table_id}:{resource}:{instance_id}`.
pub const ALLOCATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("allocations");

/// Usage snapshots keyed by `{table_id}:{epoch}:{instance_id}`.
pub const USAGE: TableDefinition<&str, &[u8]> = TableDefinition::new("usage");
