//! Allocation math — proportional-to-demand splits with a minimum floor.
//!
//! Pure functions so the policy is testable without a store or a clock.
//! Any monotone demand-proportional scheme works here; the invariants that
//! matter are: shares sum to the global capacity, no share exceeds the
//! global value, and no live instance is floored to zero.

use tollgate_core::InstanceId;

/// Compute this instance's share of a table's global capacity.
///
/// `demands` holds one entry per live instance (demand may be zero); the
/// floor reserves `min_share_fraction` of the global for every instance
/// and the remainder is split proportional to observed demand. When nobody
/// reported demand the split is equal.
pub fn proportional_share(
    global: f64,
    demands: &[(InstanceId, f64)],
    instance_id: &str,
    min_share_fraction: f64,
) -> f64 {
    if global <= 0.0 {
        return 0.0;
    }
    let n = demands.len();
    if n == 0 {
        // Nothing known about the fleet yet; trust the local view.
        return global;
    }
    let equal = global / n as f64;

    // Floors cannot sum past the global value.
    let floor = (global * min_share_fraction.clamp(0.0, 1.0)).min(equal);

    let total_demand: f64 = demands.iter().map(|(_, d)| d.max(0.0)).sum();
    if total_demand <= 0.0 {
        return equal;
    }

    let my_demand = demands
        .iter()
        .find(|(id, _)| id == instance_id)
        .map_or(0.0, |(_, d)| d.max(0.0));

    let distributable = global - floor * n as f64;
    let share = floor + distributable * (my_demand / total_demand);
    share.min(global)
}

/// Per-instance borrowable headroom for the next round.
///
/// Headroom is the capacity the fleet left unused last round, split evenly
/// and capped so that even if every instance borrows its full grant, the
/// fleet-wide achieved rate stays within 1.5× the configured limit.
pub fn borrowable_share(global: f64, total_demand: f64, live_instances: usize) -> f64 {
    if global <= 0.0 || live_instances == 0 {
        return 0.0;
    }
    let unused = (global - total_demand.max(0.0)).max(0.0);
    let capped = unused.min(0.5 * global);
    capped / live_instances as f64
}
