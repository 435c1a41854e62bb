//! Throttling policy — wraps limiter decisions into caller-visible outcomes.
//!
//! Two modes, resolved per request by an explicit boolean:
//!
//! - default: a denial blocks and retries inside the request's throttle-wait
//!   budget, surfacing a retryable throttling error only when that budget is
//!   spent;
//! - prefer-throttling-errors: a denial surfaces the typed error
//!   immediately, so latency-sensitive callers can back off themselves.
//!
//! A request deadline expiring mid-wait surfaces `Timeout`, never a
//! throttling error. No tokens are held while waiting, so dropping the
//! future (connection closed) leaks nothing.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use tollgate_core::config::LimiterConfig;
use tollgate_core::{
    AdmissionError, AdmissionResult, Charge, ResourceKind, TableLimits, TenantId, TenantLimits,
};

use crate::bucket::TokenBucket;
use crate::registry::{Admission, LimiterRegistry};

/// Per-request admission options.
#[derive(Debug, Clone, Copy)]
pub struct RequestOptions {
    /// Absolute deadline; expiring while waiting on admission surfaces
    /// `Timeout` rather than a throttling error.
    pub deadline: Option<Instant>,
    /// Total time `admit` may spend blocked on throttling before giving up
    /// with a typed throttling error.
    pub max_throttle_wait: Duration,
    /// Surface throttling errors immediately instead of waiting.
    pub prefer_throttling_errors: bool,
}

/// Outcome of a successful admission, attached to the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionOutcome {
    /// Units charged for the operation.
    pub consumed: Charge,
    /// Throttling denials encountered (and retried) along the way.
    pub throttle_retries: u32,
}

/// Tenant-scoped administrative operations with their own rate budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminOp {
    Ddl,
    TableLimitReduction,
    BillingModeChange,
}

impl AdminOp {
    fn as_str(self) -> &'static str {
        match self {
            AdminOp::Ddl => "ddl",
            AdminOp::TableLimitReduction => "table_limit_reduction",
            AdminOp::BillingModeChange => "billing_mode_change",
        }
    }

    /// Budget in operations per second, from the tenant's limits.
    fn rate_per_sec(self, limits: &TenantLimits) -> f64 {
        match self {
            AdminOp::Ddl => f64::from(limits.ddl_requests_per_min) / 60.0,
            AdminOp::TableLimitReduction => {
                f64::from(limits.table_limit_reductions_per_day) / 86_400.0
            }
            AdminOp::BillingModeChange => {
                f64::from(limits.billing_mode_changes_per_day) / 86_400.0
            }
        }
    }

    /// One full period's allowance, used as the bucket ceiling.
    fn period_budget(self, limits: &TenantLimits) -> f64 {
        match self {
            AdminOp::Ddl => f64::from(limits.ddl_requests_per_min),
            AdminOp::TableLimitReduction => f64::from(limits.table_limit_reductions_per_day),
            AdminOp::BillingModeChange => f64::from(limits.billing_mode_changes_per_day),
        }
    }
}

/// Decides retry-vs-error semantics around the limiter registry.
pub struct ThrottlingPolicy {
    registry: Arc<LimiterRegistry>,
    config: LimiterConfig,
    /// Per-(tenant, op) buckets for DDL and limits-change rates.
    admin_ops: Mutex<HashMap<(TenantId, AdminOp), TokenBucket>>,
    /// Aggregate per-(tenant, resource) buckets; a table charge must pass
    /// both its table bucket and its tenant's aggregate bucket.
    tenant_buckets: Mutex<HashMap<(TenantId, ResourceKind), TokenBucket>>,
}

impl ThrottlingPolicy {
    pub fn new(registry: Arc<LimiterRegistry>, config: LimiterConfig) -> Self {
        Self {
            registry,
            config,
            admin_ops: Mutex::new(HashMap::new()),
            tenant_buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }

    /// Options a request gets when it specifies nothing.
    pub fn default_options(&self) -> RequestOptions {
        RequestOptions {
            deadline: None,
            max_throttle_wait: Duration::from_millis(self.config.default_max_wait_ms * 10),
            prefer_throttling_errors: self.config.prefer_throttling_errors,
        }
    }

    /// Admit one operation's full charge against its table's budgets.
    ///
    /// Read and write sides are admitted independently; an operation that
    /// charges both (e.g. a return-row put) must pass both buckets.
    pub async fn admit(
        &self,
        limits: &TableLimits,
        charge: Charge,
        opts: &RequestOptions,
    ) -> AdmissionResult<AdmissionOutcome> {
        let mut retries = 0u32;
        for resource in [ResourceKind::Read, ResourceKind::Write] {
            let units = charge.units(resource);
            if units > 0 {
                self.admit_resource(limits, resource, units, opts, &mut retries)
                    .await?;
            }
        }
        Ok(AdmissionOutcome {
            consumed: charge,
            throttle_retries: retries,
        })
    }

    /// Register or refresh a tenant's aggregate throughput ceilings.
    ///
    /// Tables of an unregistered tenant are bounded by their table budgets
    /// alone.
    pub async fn set_tenant_limits(&self, limits: &TenantLimits) {
        let mut buckets = self.tenant_buckets.lock().await;
        for (resource, units) in [
            (ResourceKind::Read, limits.tenant_read_units),
            (ResourceKind::Write, limits.tenant_write_units),
        ] {
            match buckets.entry((limits.tenant_id.clone(), resource)) {
                Entry::Occupied(mut e) => e.get_mut().set_capacity(f64::from(units)),
                Entry::Vacant(v) => {
                    v.insert(TokenBucket::new(
                        f64::from(units),
                        self.config.burst_multiplier,
                    ));
                }
            }
        }
    }

    /// Charge the tenant's aggregate bucket, if one is registered.
    async fn charge_tenant(
        &self,
        tenant: &str,
        resource: ResourceKind,
        units: u32,
    ) -> Result<(), Duration> {
        let mut buckets = self.tenant_buckets.lock().await;
        let Some(bucket) = buckets.get_mut(&(tenant.to_string(), resource)) else {
            return Ok(());
        };
        if bucket.try_charge(f64::from(units)) {
            Ok(())
        } else {
            Err(bucket.wait_hint(f64::from(units)))
        }
    }

    /// Return tenant tokens for a charge the table bucket rejected.
    async fn refund_tenant(&self, tenant: &str, resource: ResourceKind, units: u32) {
        let mut buckets = self.tenant_buckets.lock().await;
        if let Some(bucket) = buckets.get_mut(&(tenant.to_string(), resource)) {
            bucket.settle(f64::from(units), 0.0);
        }
    }

    async fn admit_resource(
        &self,
        limits: &TableLimits,
        resource: ResourceKind,
        units: u32,
        opts: &RequestOptions,
        retries: &mut u32,
    ) -> AdmissionResult<()> {
        let slice = Duration::from_millis(self.config.default_max_wait_ms);
        let mut budget = opts.max_throttle_wait;

        loop {
            if let Some(deadline) = opts.deadline
                && Instant::now() >= deadline
            {
                return Err(AdmissionError::Timeout {
                    table: limits.table_id.clone(),
                });
            }

            // Fail-fast mode never sleeps, not even inside the registry's
            // bounded wait.
            let attempt_wait = if opts.prefer_throttling_errors {
                Duration::ZERO
            } else {
                slice.min(budget)
            };
            let admission = match self
                .charge_tenant(&limits.tenant_id, resource, units)
                .await
            {
                Err(retry_after) => Admission::Throttled { retry_after },
                Ok(()) => {
                    let admission = self
                        .registry
                        .try_charge(limits, resource, units, attempt_wait)
                        .await;
                    if let Admission::Throttled { .. } = admission {
                        self.refund_tenant(&limits.tenant_id, resource, units).await;
                    }
                    admission
                }
            };

            match admission {
                Admission::Admitted => return Ok(()),
                Admission::Throttled { retry_after } => {
                    *retries += 1;
                    if opts.prefer_throttling_errors {
                        return Err(throttling_error(limits, resource, retry_after));
                    }
                    budget = budget.saturating_sub(attempt_wait);
                    if budget.is_zero() {
                        debug!(
                            table = %limits.table_id,
                            %resource,
                            units,
                            retries = *retries,
                            "throttle-wait budget spent"
                        );
                        return Err(throttling_error(limits, resource, retry_after));
                    }

                    let sleep_for = retry_after.min(budget).max(Duration::from_millis(1));
                    if let Some(deadline) = opts.deadline {
                        // Never sleep past the request deadline.
                        if Instant::now() + sleep_for >= deadline {
                            tokio::time::sleep_until(deadline).await;
                            return Err(AdmissionError::Timeout {
                                table: limits.table_id.clone(),
                            });
                        }
                    }
                    tokio::time::sleep(sleep_for).await;
                    budget = budget.saturating_sub(sleep_for);
                }
            }
        }
    }

    /// Admit up to `max_units` of read work, returning what was admitted.
    ///
    /// This is the progress-guaranteed path for queries bounded to a small
    /// per-call byte budget: as long as the bucket is non-empty the call
    /// admits at least one unit and the caller accounts the partial charge.
    pub async fn admit_up_to(
        &self,
        limits: &TableLimits,
        resource: ResourceKind,
        max_units: u32,
        opts: &RequestOptions,
    ) -> AdmissionResult<u32> {
        let admitted = self
            .registry
            .try_charge_partial(limits, resource, max_units)
            .await;
        if admitted > 0 {
            return Ok(admitted);
        }

        // Bucket truly empty: one bounded wait for refill, then give up.
        let wait = Duration::from_millis(self.config.default_max_wait_ms);
        if let Some(deadline) = opts.deadline
            && Instant::now() + wait >= deadline
        {
            tokio::time::sleep_until(deadline).await;
            return Err(AdmissionError::Timeout {
                table: limits.table_id.clone(),
            });
        }
        tokio::time::sleep(wait).await;

        let admitted = self
            .registry
            .try_charge_partial(limits, resource, max_units)
            .await;
        if admitted > 0 {
            Ok(admitted)
        } else {
            Err(throttling_error(limits, resource, wait))
        }
    }

    /// Reconcile an admitted estimate against the actual charge once the
    /// operation has executed (e.g. a query whose scanned volume was only
    /// known afterwards).
    pub async fn settle(&self, limits: &TableLimits, estimated: Charge, actual: Charge) {
        for resource in [ResourceKind::Read, ResourceKind::Write] {
            let e = estimated.units(resource);
            let a = actual.units(resource);
            if e == a {
                continue;
            }
            self.registry.settle(limits, resource, e, a).await;
            let mut buckets = self.tenant_buckets.lock().await;
            if let Some(bucket) = buckets.get_mut(&(limits.tenant_id.clone(), resource)) {
                bucket.settle(f64::from(e), f64::from(a));
            }
        }
    }

    /// Admit a tenant-scoped administrative operation (DDL, limits change).
    ///
    /// Denials surface `OperationThrottling` immediately; these budgets are
    /// far too slow to wait out inline.
    pub async fn admit_admin_op(
        &self,
        limits: &TenantLimits,
        op: AdminOp,
    ) -> AdmissionResult<()> {
        let mut ops = self.admin_ops.lock().await;
        let bucket = ops
            .entry((limits.tenant_id.clone(), op))
            .or_insert_with(|| {
                // Starts holding one full period's budget, accrued slowly
                // thereafter, so a fresh tenant's first DDL always passes.
                TokenBucket::full(op.rate_per_sec(limits), op.period_budget(limits))
            });
        if bucket.try_charge(1.0) {
            Ok(())
        } else {
            Err(AdmissionError::OperationThrottling {
                tenant: limits.tenant_id.clone(),
                operation: op.as_str().to_string(),
            })
        }
    }
}

fn throttling_error(
    limits: &TableLimits,
    resource: ResourceKind,
    retry_after: Duration,
) -> AdmissionError {
    match resource {
        ResourceKind::Read => AdmissionError::ReadThrottling {
            table: limits.table_id.clone(),
            retry_after,
        },
        ResourceKind::Write => AdmissionError::WriteThrottling {
            table: limits.table_id.clone(),
            retry_after,
        },
    }
}
