//! CoordStore — redb-backed coordination state for TollGate.
//!
//! Provides typed CRUD operations over table/tenant limits, instance
//! registry records, demand reports, allocations, and usage snapshots.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use tollgate_core::{ResourceKind, TableLimits, TenantLimits};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe coordination store backed by redb.
#[derive(Clone)]
pub struct CoordStore {
    db: Arc<Database>,
}

impl CoordStore {
    /// Open (or create) a persistent coordination store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "coordination store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory coordination store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory coordination store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TABLE_LIMITS).map_err(map_err!(Table))?;
        txn.open_table(TENANT_LIMITS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(DEMAND).map_err(map_err!(Table))?;
        txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        txn.open_table(USAGE).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Table limits ───────────────────────────────────────────────

    /// Insert or replace the reconciled limits for a table.
    pub fn put_table_limits(&self, limits: &TableLimits) -> StateResult<()> {
        let value = serde_json::to_vec(limits).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TABLE_LIMITS).map_err(map_err!(Table))?;
            table
                .insert(limits.table_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(table = %limits.table_id, "table limits stored");
        Ok(())
    }

    /// Get the limits for a table, if present.
    pub fn get_table_limits(&self, table_id: &str) -> StateResult<Option<TableLimits>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TABLE_LIMITS).map_err(map_err!(Table))?;
        match table.get(table_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let limits: TableLimits =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(limits))
            }
            None => Ok(None),
        }
    }

    /// List limits for all known tables.
    pub fn list_table_limits(&self) -> StateResult<Vec<TableLimits>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TABLE_LIMITS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let limits: TableLimits =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(limits);
        }
        Ok(results)
    }

    /// Remove a dropped table's limits plus its demand and allocation
    /// records. Returns true if the limits record existed.
    pub fn delete_table(&self, table_id: &str) -> StateResult<bool> {
        let prefix = format!("{table_id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(TABLE_LIMITS).map_err(map_err!(Table))?;
            existed = table.remove(table_id).map_err(map_err!(Write))?.is_some();
        }
        for def in [DEMAND, ALLOCATIONS] {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let keys: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            for k in keys {
                table.remove(k.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(table = %table_id, existed, "table records deleted");
        Ok(existed)
    }

    // ── Tenant limits ──────────────────────────────────────────────

    /// Insert or replace the reconciled limits for a tenant.
    pub fn put_tenant_limits(&self, limits: &TenantLimits) -> StateResult<()> {
        let value = serde_json::to_vec(limits).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TENANT_LIMITS).map_err(map_err!(Table))?;
            table
                .insert(limits.tenant_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the limits for a tenant, if present.
    pub fn get_tenant_limits(&self, tenant_id: &str) -> StateResult<Option<TenantLimits>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TENANT_LIMITS).map_err(map_err!(Table))?;
        match table.get(tenant_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let limits: TenantLimits =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(limits))
            }
            None => Ok(None),
        }
    }

    // ── Instance registry ──────────────────────────────────────────

    /// Insert or update an instance registry record (heartbeat).
    pub fn put_instance(&self, record: &InstanceRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table
                .insert(record.instance_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List all registered instances, live or stale.
    pub fn list_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: InstanceRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Delete an instance registry record. Returns true if it existed.
    pub fn delete_instance(&self, instance_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            existed = table.remove(instance_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Demand reports ─────────────────────────────────────────────

    /// Publish one instance's demand report for a (table, resource).
    pub fn put_demand(&self, report: &DemandReport) -> StateResult<()> {
        let key = report.table_key();
        let value = serde_json::to_vec(report).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEMAND).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List every instance's latest demand report for a (table, resource).
    pub fn list_demand(
        &self,
        table_id: &str,
        resource: ResourceKind,
    ) -> StateResult<Vec<DemandReport>> {
        let prefix = format!("{table_id}:{}:", resource.as_str());
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEMAND).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let report: DemandReport =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(report);
            }
        }
        Ok(results)
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Publish the revised allocation for one instance.
    pub fn put_allocation(&self, alloc: &AllocationRecord) -> StateResult<()> {
        let key = alloc.table_key();
        let value = serde_json::to_vec(alloc).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the current allocation for one (table, resource, instance).
    pub fn get_allocation(
        &self,
        table_id: &str,
        resource: ResourceKind,
        instance_id: &str,
    ) -> StateResult<Option<AllocationRecord>> {
        let key = demand_key(table_id, resource, instance_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let alloc: AllocationRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(alloc))
            }
            None => Ok(None),
        }
    }

    /// List every instance's allocation for a (table, resource).
    pub fn list_allocations(
        &self,
        table_id: &str,
        resource: ResourceKind,
    ) -> StateResult<Vec<AllocationRecord>> {
        let prefix = format!("{table_id}:{}:", resource.as_str());
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let alloc: AllocationRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(alloc);
            }
        }
        Ok(results)
    }

    // ── Usage snapshots ────────────────────────────────────────────

    /// Persist a usage snapshot.
    pub fn put_usage(&self, snapshot: &UsageSnapshot) -> StateResult<()> {
        let key = snapshot.table_key();
        let value = serde_json::to_vec(snapshot).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(USAGE).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List the most recent usage snapshots for a table, newest first.
    pub fn list_usage(&self, table_id: &str, limit: usize) -> StateResult<Vec<UsageSnapshot>> {
        let prefix = format!("{table_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(USAGE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let snapshot: UsageSnapshot =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(snapshot);
            }
        }
        results.sort_by(|a, b| b.epoch.cmp(&a.epoch));
        results.truncate(limit);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::CapacityMode;

    fn limits(table_id: &str, read: u32, write: u32) -> TableLimits {
        TableLimits {
            table_id: table_id.into(),
            tenant_id: "acme".into(),
            read_units_per_sec: read,
            write_units_per_sec: write,
            storage_gb: 25,
            mode: CapacityMode::Provisioned,
        }
    }

    #[test]
    fn table_limits_crud() {
        let store = CoordStore::open_in_memory().unwrap();
        assert!(store.get_table_limits("orders").unwrap().is_none());

        store.put_table_limits(&limits("orders", 100, 50)).unwrap();
        let got = store.get_table_limits("orders").unwrap().unwrap();
        assert_eq!(got.read_units_per_sec, 100);

        // Replace on change (DDL raised the limit).
        store.put_table_limits(&limits("orders", 200, 50)).unwrap();
        let got = store.get_table_limits("orders").unwrap().unwrap();
        assert_eq!(got.read_units_per_sec, 200);

        assert!(store.delete_table("orders").unwrap());
        assert!(!store.delete_table("orders").unwrap());
    }

    #[test]
    fn demand_prefix_scan_is_per_resource() {
        let store = CoordStore::open_in_memory().unwrap();
        for (instance, resource) in [
            ("proxy-1", ResourceKind::Read),
            ("proxy-2", ResourceKind::Read),
            ("proxy-1", ResourceKind::Write),
        ] {
            store
                .put_demand(&DemandReport {
                    table_id: "orders".into(),
                    resource,
                    instance_id: instance.into(),
                    demand_per_sec: 10.0,
                    epoch: 1,
                })
                .unwrap();
        }

        let reads = store.list_demand("orders", ResourceKind::Read).unwrap();
        assert_eq!(reads.len(), 2);
        let writes = store.list_demand("orders", ResourceKind::Write).unwrap();
        assert_eq!(writes.len(), 1);
        assert!(store.list_demand("other", ResourceKind::Read).unwrap().is_empty());
    }

    #[test]
    fn delete_table_sweeps_demand_and_allocations() {
        let store = CoordStore::open_in_memory().unwrap();
        store.put_table_limits(&limits("orders", 100, 50)).unwrap();
        store
            .put_demand(&DemandReport {
                table_id: "orders".into(),
                resource: ResourceKind::Read,
                instance_id: "proxy-1".into(),
                demand_per_sec: 10.0,
                epoch: 1,
            })
            .unwrap();
        store
            .put_allocation(&AllocationRecord {
                table_id: "orders".into(),
                resource: ResourceKind::Read,
                instance_id: "proxy-1".into(),
                capacity_per_sec: 50.0,
                borrowable_per_sec: 0.0,
                epoch: 1,
            })
            .unwrap();

        assert!(store.delete_table("orders").unwrap());
        assert!(store.list_demand("orders", ResourceKind::Read).unwrap().is_empty());
        assert!(store
            .get_allocation("orders", ResourceKind::Read, "proxy-1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn instances_heartbeat_overwrites() {
        let store = CoordStore::open_in_memory().unwrap();
        let mut record = InstanceRecord {
            instance_id: "proxy-1".into(),
            last_heartbeat: 100,
            started_at: 100,
        };
        store.put_instance(&record).unwrap();
        record.last_heartbeat = 105;
        store.put_instance(&record).unwrap();

        let all = store.list_instances().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].last_heartbeat, 105);
    }

    #[test]
    fn usage_snapshots_newest_first() {
        let store = CoordStore::open_in_memory().unwrap();
        for epoch in [10, 30, 20] {
            store
                .put_usage(&UsageSnapshot {
                    table_id: "orders".into(),
                    instance_id: "proxy-1".into(),
                    epoch,
                    read_units: epoch,
                    write_units: 0,
                    admitted: 1,
                    throttled: 0,
                    throttle_retries: 0,
                })
                .unwrap();
        }
        let recent = store.list_usage("orders", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].epoch, 30);
        assert_eq!(recent[1].epoch, 20);
    }

    #[test]
    fn on_disk_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coord.redb");
        {
            let store = CoordStore::open(&path).unwrap();
            store.put_table_limits(&limits("orders", 100, 50)).unwrap();
        }
        let store = CoordStore::open(&path).unwrap();
        assert!(store.get_table_limits("orders").unwrap().is_some());
    }
}
