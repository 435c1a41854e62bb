//! Token bucket — the unit of local admission state.
//!
//! Tokens accrue continuously at `capacity_per_sec`, capped at the burst
//! ceiling (a small multiple of the per-second capacity, so short bursts
//! pass while the average holds over the reconciliation window). The bucket
//! itself is not thread-safe; the registry wraps each one in a mutex.
//!
//! Time comes from `tokio::time::Instant`, which is monotonic (no clock
//! skew backdating) and respects `tokio::time::pause()` in tests.

use std::time::Duration;

use tokio::time::Instant;

/// A token bucket for one (table, resource) pair on one proxy instance.
#[derive(Debug)]
pub struct TokenBucket {
    capacity_per_sec: f64,
    burst_multiplier: f64,
    available: f64,
    last_refill: Instant,
    /// Units consumed since the last demand drain, for fleet reporting.
    consumed: f64,
}

impl TokenBucket {
    /// Create a bucket starting with one second's worth of tokens.
    pub fn new(capacity_per_sec: f64, burst_multiplier: f64) -> Self {
        let capacity_per_sec = capacity_per_sec.max(0.0);
        Self {
            capacity_per_sec,
            burst_multiplier: burst_multiplier.max(1.0),
            available: capacity_per_sec,
            last_refill: Instant::now(),
            consumed: 0.0,
        }
    }

    /// Create a bucket holding a full custom ceiling of tokens.
    ///
    /// Used for slow administrative budgets (per-minute, per-day) where the
    /// burst is one full period's allowance rather than a multiple of the
    /// per-second rate: the first operations of a fresh period always pass.
    pub fn full(capacity_per_sec: f64, ceiling_units: f64) -> Self {
        let capacity_per_sec = capacity_per_sec.max(0.0);
        let ceiling_units = ceiling_units.max(1.0);
        let burst_multiplier = if capacity_per_sec > 0.0 {
            ceiling_units / capacity_per_sec
        } else {
            1.0
        };
        Self {
            capacity_per_sec,
            burst_multiplier,
            available: ceiling_units,
            last_refill: Instant::now(),
            consumed: 0.0,
        }
    }

    /// The cap on accumulated tokens.
    ///
    /// Never below one unit, so tables with tiny budgets can still admit
    /// single-unit operations.
    pub fn burst_ceiling(&self) -> f64 {
        (self.capacity_per_sec * self.burst_multiplier).max(1.0)
    }

    /// Current refill rate in units per second.
    pub fn capacity_per_sec(&self) -> f64 {
        self.capacity_per_sec
    }

    /// Tokens available right now, after refill.
    pub fn available(&mut self) -> f64 {
        self.refill();
        self.available
    }

    /// Accrue tokens for the wall-clock time elapsed since the last refill.
    fn refill(&mut self) {
        let now = Instant::now();
        // duration_since saturates to zero, so an earlier instant can
        // never drain the bucket.
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.available =
            (self.available + elapsed * self.capacity_per_sec).min(self.burst_ceiling());
    }

    /// Atomically take `units` tokens if the balance covers them.
    ///
    /// Exactly the remaining balance is admitted; one unit more is denied.
    pub fn try_charge(&mut self, units: f64) -> bool {
        self.refill();
        if self.available >= units {
            self.available -= units;
            self.consumed += units;
            true
        } else {
            false
        }
    }

    /// Take up to `units` tokens, returning the amount actually taken.
    ///
    /// Admits partial work whenever the bucket is non-empty. This is the
    /// forward-progress path for callers with tiny per-request byte
    /// budgets: they account for the partial charge themselves instead of
    /// being denied outright.
    pub fn try_charge_partial(&mut self, units: f64) -> f64 {
        self.refill();
        if self.available <= 0.0 || units <= 0.0 {
            return 0.0;
        }
        let taken = units.min(self.available);
        self.available -= taken;
        self.consumed += taken;
        taken
    }

    /// Time until `units` tokens will be available, assuming no other
    /// consumers.
    pub fn wait_hint(&mut self, units: f64) -> Duration {
        self.refill();
        if self.available >= units {
            return Duration::ZERO;
        }
        if self.capacity_per_sec <= 0.0 {
            // A zero-capacity bucket never refills; signal a long wait.
            return Duration::from_secs(60);
        }
        Duration::from_secs_f64((units - self.available) / self.capacity_per_sec)
    }

    /// Replace the refill rate, clamping the balance to the new ceiling.
    ///
    /// Called by the fleet coordinator under the registry's entry mutex, so
    /// concurrent `try_charge` calls never observe a half-updated capacity.
    pub fn set_capacity(&mut self, capacity_per_sec: f64) {
        self.refill();
        self.capacity_per_sec = capacity_per_sec.max(0.0);
        self.available = self.available.min(self.burst_ceiling());
    }

    /// Reconcile an estimated charge against the actual cost once known.
    ///
    /// Overruns are deducted from the current balance, clamping at zero;
    /// underruns are refunded up to the burst ceiling. The consumed counter
    /// ends up reflecting the actual cost either way.
    pub fn settle(&mut self, estimated: f64, actual: f64) {
        self.refill();
        let delta = actual - estimated;
        self.available = (self.available - delta).clamp(0.0, self.burst_ceiling());
        self.consumed = (self.consumed + delta).max(0.0);
    }

    /// Drain the consumed-units counter for demand reporting.
    pub fn take_consumed(&mut self) -> f64 {
        std::mem::take(&mut self.consumed)
    }
}
