//! Usage collector — tracks per-table admission metrics.
//!
//! Counters are atomics behind a shared map; the snapshot loop drains them
//! into the coordination store on a fixed interval. Charged units are also
//! what operators reconcile bills against, so the counters survive even
//! when no scraper is attached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use tracing::debug;

use tollgate_core::{Charge, InstanceId, TableId};
use tollgate_state::{CoordStore, UsageSnapshot};

/// Per-table counter bucket.
#[derive(Default)]
struct TableUsage {
    read_units: AtomicU64,
    write_units: AtomicU64,
    admitted: AtomicU64,
    throttled: AtomicU64,
    throttle_retries: AtomicU64,
}

impl TableUsage {
    /// Reset counters for a new snapshot window.
    fn reset(&self) {
        self.read_units.store(0, Ordering::Relaxed);
        self.write_units.store(0, Ordering::Relaxed);
        self.admitted.store(0, Ordering::Relaxed);
        self.throttled.store(0, Ordering::Relaxed);
        self.throttle_retries.store(0, Ordering::Relaxed);
    }
}

/// Collects admission metrics across all tables and periodically snapshots
/// them to the coordination store.
pub struct UsageCollector {
    /// Per-table counters: table_id → usage.
    tables: Arc<RwLock<HashMap<TableId, Arc<TableUsage>>>>,
    store: CoordStore,
    instance_id: InstanceId,
    /// Snapshot interval.
    interval: Duration,
}

impl UsageCollector {
    pub fn new(store: CoordStore, instance_id: impl Into<InstanceId>, interval: Duration) -> Self {
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            store,
            instance_id: instance_id.into(),
            interval,
        }
    }

    async fn usage_for(&self, table_id: &str) -> Arc<TableUsage> {
        {
            let tables = self.tables.read().await;
            if let Some(usage) = tables.get(table_id) {
                return Arc::clone(usage);
            }
        }
        let mut tables = self.tables.write().await;
        Arc::clone(tables.entry(table_id.to_string()).or_default())
    }

    /// Record an admitted operation: its charge and any throttling retries
    /// it survived along the way.
    pub async fn record_admission(&self, table_id: &str, consumed: Charge, throttle_retries: u32) {
        let usage = self.usage_for(table_id).await;
        usage
            .read_units
            .fetch_add(u64::from(consumed.read_units), Ordering::Relaxed);
        usage
            .write_units
            .fetch_add(u64::from(consumed.write_units), Ordering::Relaxed);
        usage.admitted.fetch_add(1, Ordering::Relaxed);
        usage
            .throttle_retries
            .fetch_add(u64::from(throttle_retries), Ordering::Relaxed);
    }

    /// Record an operation that gave up throttled.
    pub async fn record_throttled(&self, table_id: &str) {
        let usage = self.usage_for(table_id).await;
        usage.throttled.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of all tables, persist it, and reset the window.
    pub async fn snapshot(&self) -> anyhow::Result<Vec<UsageSnapshot>> {
        let tables = self.tables.read().await;
        let epoch = epoch_secs();
        let mut snapshots = Vec::with_capacity(tables.len());

        for (table_id, usage) in tables.iter() {
            let snapshot = UsageSnapshot {
                table_id: table_id.clone(),
                instance_id: self.instance_id.clone(),
                epoch,
                read_units: usage.read_units.load(Ordering::Relaxed),
                write_units: usage.write_units.load(Ordering::Relaxed),
                admitted: usage.admitted.load(Ordering::Relaxed),
                throttled: usage.throttled.load(Ordering::Relaxed),
                throttle_retries: usage.throttle_retries.load(Ordering::Relaxed),
            };
            self.store.put_usage(&snapshot)?;
            snapshots.push(snapshot);
            usage.reset();
        }

        debug!(tables = snapshots.len(), epoch, "usage snapshot persisted");
        Ok(snapshots)
    }

    /// Run the snapshot loop.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.snapshot().await {
                        tracing::error!(error = %e, "usage snapshot failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("usage collector shutting down");
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
