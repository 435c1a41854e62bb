//! Fleet coordinator — the per-process reconciliation task.
//!
//! Each round: heartbeat, publish observed demand, read the fleet's
//! reports, recompute this instance's allocations, and apply them to the
//! local buckets. Capacity updates land under the limiter's entry mutex,
//! so concurrent charges never observe a half-updated value.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use tollgate_core::config::FleetConfig;
use tollgate_core::{InstanceId, ResourceKind, TableId, TableLimits};
use tollgate_limiter::LimiterRegistry;
use tollgate_state::{AllocationRecord, CoordStore, DemandReport, InstanceRecord};

/// Summary of one reconciliation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileStats {
    pub live_instances: usize,
    pub tables_reconciled: usize,
    pub demand_reports: usize,
}

/// Redistributes each table's global budget across the fleet.
pub struct FleetCoordinator {
    instance_id: InstanceId,
    store: CoordStore,
    registry: Arc<LimiterRegistry>,
    config: FleetConfig,
    started_at: u64,
    last_round: Option<Instant>,
    /// Fleet size from the last successful round, for degraded fallback.
    last_known_instances: usize,
    /// Last limits seen per table, for degraded fallback.
    limits_cache: HashMap<TableId, TableLimits>,
}

impl FleetCoordinator {
    pub fn new(
        instance_id: impl Into<InstanceId>,
        store: CoordStore,
        registry: Arc<LimiterRegistry>,
        config: FleetConfig,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            store,
            registry,
            config,
            started_at: epoch_secs(),
            last_round: None,
            last_known_instances: 1,
            limits_cache: HashMap::new(),
        }
    }

    /// Write this instance's registry record.
    pub fn heartbeat(&self) -> anyhow::Result<()> {
        self.store.put_instance(&InstanceRecord {
            instance_id: self.instance_id.clone(),
            last_heartbeat: epoch_secs(),
            started_at: self.started_at,
        })?;
        Ok(())
    }

    /// Instances whose heartbeat is within the staleness window.
    fn live_instances(&self) -> anyhow::Result<Vec<InstanceId>> {
        let now = epoch_secs();
        let stale = self.config.instance_stale_secs;
        Ok(self
            .store
            .list_instances()?
            .into_iter()
            .filter(|r| now.saturating_sub(r.last_heartbeat) <= stale)
            .map(|r| r.instance_id)
            .collect())
    }

    /// Run one reconciliation round.
    pub async fn reconcile_once(&mut self) -> anyhow::Result<ReconcileStats> {
        self.heartbeat()?;

        let now = Instant::now();
        let elapsed = self
            .last_round
            .map(|t| now.duration_since(t))
            .unwrap_or_else(|| Duration::from_millis(self.config.reconcile_interval_ms))
            .as_secs_f64()
            .max(0.001);
        self.last_round = Some(now);
        let epoch = epoch_secs();

        // Publish what this instance actually consumed since last round.
        let consumed = self.registry.take_demand().await;
        for (table, resource, units) in &consumed {
            self.store.put_demand(&DemandReport {
                table_id: table.clone(),
                resource: *resource,
                instance_id: self.instance_id.clone(),
                demand_per_sec: units / elapsed,
                epoch,
            })?;
        }

        let live = self.live_instances()?;
        self.last_known_instances = live.len().max(1);

        // Recompute this instance's share for every active limiter.
        let mut stats = ReconcileStats {
            live_instances: live.len(),
            demand_reports: consumed.len(),
            ..ReconcileStats::default()
        };
        for (table, resource) in self.registry.active().await {
            let Some(limits) = self.store.get_table_limits(&table)? else {
                // Limits not seeded yet; keep the current local view.
                continue;
            };
            let global = f64::from(limits.capacity(resource));
            self.limits_cache.insert(table.clone(), limits);

            // Everyone's latest reports, restricted to live instances; an
            // instance that has not reported yet counts as zero demand.
            let mut demands: Vec<(InstanceId, f64)> = self
                .store
                .list_demand(&table, resource)?
                .into_iter()
                .filter(|r| live.contains(&r.instance_id))
                .map(|r| (r.instance_id, r.demand_per_sec))
                .collect();
            for id in &live {
                if !demands.iter().any(|(known, _)| known == id) {
                    demands.push((id.clone(), 0.0));
                }
            }
            let total_demand: f64 = demands.iter().map(|(_, d)| d.max(0.0)).sum();

            let share = crate::allocation::proportional_share(
                global,
                &demands,
                &self.instance_id,
                self.config.min_share_fraction,
            );
            let borrowable =
                crate::allocation::borrowable_share(global, total_demand, live.len().max(1));

            self.registry
                .set_capacity(&table, resource, share, borrowable)
                .await;
            self.store.put_allocation(&AllocationRecord {
                table_id: table.clone(),
                resource,
                instance_id: self.instance_id.clone(),
                capacity_per_sec: share,
                borrowable_per_sec: borrowable,
                epoch,
            })?;

            debug!(
                table = %table,
                %resource,
                share,
                borrowable,
                total_demand,
                "allocation reconciled"
            );
            stats.tables_reconciled += 1;
        }

        Ok(stats)
    }

    /// Degraded fallback when the coordination store is unreachable:
    /// an equal static share of the last known limits and fleet size.
    ///
    /// Over-admission stays bounded and requests never fail because
    /// coordination is down.
    pub async fn fallback_equal_share(&self) {
        let n = self.last_known_instances.max(1) as f64;
        for (table, resource) in self.registry.active().await {
            if let Some(limits) = self.limits_cache.get(&table) {
                let share = f64::from(limits.capacity(resource)) / n;
                // No borrowing while blind: headroom data would be stale.
                self.registry.set_capacity(&table, resource, share, 0.0).await;
            }
        }
        warn!(
            instances = self.last_known_instances,
            "coordination unavailable, using equal static shares"
        );
    }

    /// Tear down all fleet and limiter state for a dropped table.
    pub async fn table_dropped(&self, table_id: &str) -> anyhow::Result<()> {
        self.store.delete_table(table_id)?;
        self.registry.drop_table(table_id).await;
        info!(table = %table_id, "table dropped, limiter state cleared");
        Ok(())
    }

    /// Run the reconciliation loop.
    pub async fn run(
        &mut self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(
            instance = %self.instance_id,
            interval_ms = interval.as_millis() as u64,
            "fleet coordinator started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.reconcile_once().await {
                        Ok(stats) => {
                            debug!(
                                live = stats.live_instances,
                                tables = stats.tables_reconciled,
                                "reconciliation round complete"
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "reconciliation failed");
                            self.fallback_equal_share().await;
                        }
                    }
                    self.registry.gc().await;
                }
                _ = shutdown.changed() => {
                    info!(instance = %self.instance_id, "fleet coordinator shutting down");
                    break;
                }
            }
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;
    use tollgate_core::config::LimiterConfig;
    use tollgate_core::CapacityMode;

    fn limits(read: u32, write: u32) -> TableLimits {
        TableLimits {
            table_id: "orders".into(),
            tenant_id: "acme".into(),
            read_units_per_sec: read,
            write_units_per_sec: write,
            storage_gb: 25,
            mode: CapacityMode::Provisioned,
        }
    }

    fn node(store: &CoordStore, id: &str) -> (Arc<LimiterRegistry>, FleetCoordinator) {
        let registry = Arc::new(LimiterRegistry::new(LimiterConfig::default()));
        let coordinator = FleetCoordinator::new(
            id,
            store.clone(),
            Arc::clone(&registry),
            FleetConfig::default(),
        );
        (registry, coordinator)
    }

    #[tokio::test(start_paused = true)]
    async fn demand_proportional_split_across_two_instances() {
        let store = CoordStore::open_in_memory().unwrap();
        store.put_table_limits(&limits(100, 50)).unwrap();
        let l = limits(100, 50);

        let (reg_a, mut coord_a) = node(&store, "proxy-a");
        let (reg_b, mut coord_b) = node(&store, "proxy-b");

        // proxy-a is hot, proxy-b nearly idle.
        assert!(reg_a
            .try_charge(&l, ResourceKind::Read, 80, Duration::ZERO)
            .await
            .is_admitted());
        assert!(reg_b
            .try_charge(&l, ResourceKind::Read, 10, Duration::ZERO)
            .await
            .is_admitted());

        // Two rounds so both sides see each other's reports; demand is
        // re-driven between rounds because each round drains the counters.
        coord_a.reconcile_once().await.unwrap();
        coord_b.reconcile_once().await.unwrap();
        advance(Duration::from_secs(5)).await;
        assert!(reg_a
            .try_charge(&l, ResourceKind::Read, 80, Duration::ZERO)
            .await
            .is_admitted());
        assert!(reg_b
            .try_charge(&l, ResourceKind::Read, 10, Duration::ZERO)
            .await
            .is_admitted());
        coord_a.reconcile_once().await.unwrap();
        coord_b.reconcile_once().await.unwrap();

        let alloc_a = store
            .get_allocation("orders", ResourceKind::Read, "proxy-a")
            .unwrap()
            .unwrap();
        let alloc_b = store
            .get_allocation("orders", ResourceKind::Read, "proxy-b")
            .unwrap()
            .unwrap();

        assert!(alloc_a.capacity_per_sec > alloc_b.capacity_per_sec);
        // Fleet invariant: shares sum to the global capacity, and nobody
        // exceeds it alone.
        let total = alloc_a.capacity_per_sec + alloc_b.capacity_per_sec;
        assert!((total - 100.0).abs() < 1.0, "total {total}");
        assert!(alloc_a.capacity_per_sec <= 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_fleet_publishes_borrowable_headroom() {
        let store = CoordStore::open_in_memory().unwrap();
        store.put_table_limits(&limits(100, 50)).unwrap();
        let l = limits(100, 50);

        let (reg, mut coord) = node(&store, "proxy-a");
        // Touch the table so a limiter exists, with almost no demand.
        assert!(reg
            .try_charge(&l, ResourceKind::Read, 1, Duration::ZERO)
            .await
            .is_admitted());

        coord.reconcile_once().await.unwrap();

        let alloc = store
            .get_allocation("orders", ResourceKind::Read, "proxy-a")
            .unwrap()
            .unwrap();
        assert!(alloc.borrowable_per_sec > 0.0);
        assert!(alloc.borrowable_per_sec <= 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_limits_record_leaves_local_view() {
        let store = CoordStore::open_in_memory().unwrap();
        let l = limits(100, 50);

        let (reg, mut coord) = node(&store, "proxy-a");
        assert!(reg
            .try_charge(&l, ResourceKind::Read, 1, Duration::ZERO)
            .await
            .is_admitted());

        // No limits seeded in the store: the round skips the table.
        let stats = coord.reconcile_once().await.unwrap();
        assert_eq!(stats.tables_reconciled, 0);
        assert!(store
            .get_allocation("orders", ResourceKind::Read, "proxy-a")
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_sets_equal_static_shares() {
        let store = CoordStore::open_in_memory().unwrap();
        store.put_table_limits(&limits(100, 50)).unwrap();
        let l = limits(100, 50);

        let (reg, mut coord) = node(&store, "proxy-a");
        assert!(reg
            .try_charge(&l, ResourceKind::Read, 1, Duration::ZERO)
            .await
            .is_admitted());

        // A successful round caches the limits and the fleet size.
        coord.reconcile_once().await.unwrap();

        // Pretend a second instance was known, then lose coordination.
        coord.last_known_instances = 2;
        coord.fallback_equal_share().await;

        // Drain whatever is left, then measure one second of refill: the
        // bucket now runs at the 50/sec static share.
        reg.try_charge_partial(&l, ResourceKind::Read, 10_000).await;
        advance(Duration::from_secs(1)).await;
        let refilled = reg.try_charge_partial(&l, ResourceKind::Read, 10_000).await;
        assert!(refilled >= 49 && refilled <= 51, "refilled {refilled}");
    }

    #[tokio::test(start_paused = true)]
    async fn table_dropped_clears_everything() {
        let store = CoordStore::open_in_memory().unwrap();
        store.put_table_limits(&limits(100, 50)).unwrap();
        let l = limits(100, 50);

        let (reg, mut coord) = node(&store, "proxy-a");
        assert!(reg
            .try_charge(&l, ResourceKind::Read, 1, Duration::ZERO)
            .await
            .is_admitted());
        coord.reconcile_once().await.unwrap();

        coord.table_dropped("orders").await.unwrap();
        assert!(reg.active().await.is_empty());
        assert!(store.get_table_limits("orders").unwrap().is_none());
        assert!(store
            .get_allocation("orders", ResourceKind::Read, "proxy-a")
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ddl_limit_change_applies_next_round() {
        let store = CoordStore::open_in_memory().unwrap();
        store.put_table_limits(&limits(100, 50)).unwrap();
        let l = limits(100, 50);

        let (reg, mut coord) = node(&store, "proxy-a");
        assert!(reg
            .try_charge(&l, ResourceKind::Read, 1, Duration::ZERO)
            .await
            .is_admitted());
        coord.reconcile_once().await.unwrap();

        // DDL doubles the read budget; the next round picks it up.
        store.put_table_limits(&limits(200, 50)).unwrap();
        advance(Duration::from_secs(5)).await;
        coord.reconcile_once().await.unwrap();

        let alloc = store
            .get_allocation("orders", ResourceKind::Read, "proxy-a")
            .unwrap()
            .unwrap();
        assert!((alloc.capacity_per_sec - 200.0).abs() < 1e-9);
    }
}
