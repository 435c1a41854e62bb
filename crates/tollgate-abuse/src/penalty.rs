//! Per-client penalty state machine.
//!
//! Normal → Elevated → Throttled, driven by error counts in a sliding
//! window; a quiet period resets to Normal. The first few errors from a
//! fresh client are never penalized, so a legitimate client probing a
//! misconfiguration gets fast, correctly-coded error responses.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use tollgate_core::config::AbuseConfig;
use tollgate_core::ClientId;

/// Outcome of request decoding/execution, as reported by the upstream
/// decoder. This crate never re-validates protocol correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Well-formed request that succeeded.
    Ok,
    /// Protocol-invalid request or a flagged semantic error.
    UserError,
    /// Server-side failure; never the client's fault, never penalized.
    ServerError,
}

/// Escalation level for one client identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PenaltyLevel {
    #[default]
    Normal,
    /// Erroring responses are delayed by a bounded penalty latency.
    Elevated,
    /// Erroring responses are delayed near/past the request timeout.
    Throttled,
}

#[derive(Debug)]
struct PenaltyState {
    level: PenaltyLevel,
    /// Errors observed in the current sliding window.
    window_count: u32,
    window_start: Instant,
    /// Errors observed over the client's tracked lifetime; the grace
    /// count compares against this.
    lifetime_errors: u64,
    last_error: Instant,
}

impl PenaltyState {
    fn fresh(now: Instant) -> Self {
        Self {
            level: PenaltyLevel::Normal,
            window_count: 0,
            window_start: now,
            lifetime_errors: 0,
            last_error: now,
        }
    }
}

/// Tracks per-client error rates and hands out escalating delays.
pub struct AbusePenaltyLimiter {
    config: AbuseConfig,
    clients: Mutex<LruCache<ClientId, PenaltyState>>,
}

impl AbusePenaltyLimiter {
    pub fn new(config: AbuseConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_tracked_clients.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            clients: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Record a request outcome and return the delay, if any, to apply to
    /// this response before emitting it.
    ///
    /// Only error-classified outcomes are ever delayed: a penalized
    /// client's well-formed requests keep flowing at baseline latency.
    pub async fn observe(&self, client: &str, outcome: RequestOutcome) -> Option<Duration> {
        if !matches!(outcome, RequestOutcome::UserError) {
            return None;
        }
        let now = Instant::now();
        let mut clients = self.clients.lock().await;
        let state = match clients.get_mut(client) {
            Some(state) => state,
            None => {
                // Created lazily on the first observed error.
                clients.put(client.to_string(), PenaltyState::fresh(now));
                clients.get_mut(client)?
            }
        };

        // A quiet period resets the escalation before the new error counts.
        if now.duration_since(state.last_error) > self.cooldown() {
            if state.level != PenaltyLevel::Normal {
                debug!(%client, "penalty cooled down, back to normal");
            }
            state.level = PenaltyLevel::Normal;
            state.window_count = 0;
            state.window_start = now;
        }

        if now.duration_since(state.window_start) > self.window() {
            state.window_count = 0;
            state.window_start = now;
        }

        state.window_count += 1;
        state.lifetime_errors += 1;
        state.last_error = now;

        // The first handful of errors from a fresh client stays fast.
        if state.lifetime_errors <= u64::from(self.config.grace_errors) {
            return None;
        }

        let next = if state.window_count > self.config.throttle_threshold {
            PenaltyLevel::Throttled
        } else if state.window_count > self.config.elevate_threshold {
            PenaltyLevel::Elevated
        } else {
            state.level
        };
        if next != state.level {
            info!(%client, ?next, errors = state.window_count, "abuse penalty escalated");
            state.level = next;
        }

        match state.level {
            PenaltyLevel::Normal => None,
            PenaltyLevel::Elevated => Some(Duration::from_millis(self.config.elevated_delay_ms)),
            PenaltyLevel::Throttled => Some(Duration::from_millis(self.config.throttled_delay_ms)),
        }
    }

    /// Current escalation level for a client, after cooldown accounting.
    pub async fn level(&self, client: &str) -> PenaltyLevel {
        let now = Instant::now();
        let mut clients = self.clients.lock().await;
        match clients.peek(client) {
            Some(state) if now.duration_since(state.last_error) <= self.cooldown() => state.level,
            Some(_) => {
                // Cooled down; forget the client entirely.
                clients.pop(client);
                PenaltyLevel::Normal
            }
            None => PenaltyLevel::Normal,
        }
    }

    /// The delay currently applied to this client's erroring responses.
    pub async fn penalty_delay(&self, client: &str) -> Option<Duration> {
        match self.level(client).await {
            PenaltyLevel::Normal => None,
            PenaltyLevel::Elevated => Some(Duration::from_millis(self.config.elevated_delay_ms)),
            PenaltyLevel::Throttled => {
                Some(Duration::from_millis(self.config.throttled_delay_ms))
            }
        }
    }

    /// Number of client identities currently tracked.
    pub async fn tracked(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Drop every client that has been quiet past the cooldown window.
    ///
    /// The LRU cap already bounds memory; sweeping keeps lookups cheap on
    /// long-running instances.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let cooldown = self.cooldown();
        let mut clients = self.clients.lock().await;
        let expired: Vec<ClientId> = clients
            .iter()
            .filter(|(_, state)| now.duration_since(state.last_error) > cooldown)
            .map(|(client, _)| client.clone())
            .collect();
        for client in &expired {
            clients.pop(client);
        }
        if !expired.is_empty() {
            debug!(expired = expired.len(), "cooled-down clients swept");
        }
        expired.len()
    }

    /// Apply a penalty delay before emitting a response.
    ///
    /// Just an awaitable sleep: dropping the future (connection closed,
    /// request timed out) cancels the delay without leaking anything.
    pub async fn apply(delay: Duration) {
        tokio::time::sleep(delay).await;
    }

    /// Periodic sweep loop.
    pub async fn run_sweeper(
        &self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    debug!("abuse sweeper shutting down");
                    break;
                }
            }
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.config.cooldown_secs)
    }
}
