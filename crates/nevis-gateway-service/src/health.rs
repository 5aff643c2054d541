//! Per-adapter circuit breakers.
//!
//! - **Closed**: calls pass through.
//! - **Open**: `failure_threshold` consecutive failures were seen; calls are
//!   rejected until `cooldown` elapses.
//! - **Half-open**: one trial call is let through. Success closes the breaker,
//!   failure re-opens it and restarts the cool-down.
//!
//! State is in-memory only and self-heals after a restart. Each adapter sits
//! behind its own mutex so one busy adapter never blocks another.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock};

use serde::Serialize;
use tokio::time::Instant;

use crate::config::BreakerConfig;

/// Breaker state of one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Skipped by the router.
    Open,
    /// One trial call allowed.
    HalfOpen,
}

/// Router-facing verdict for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed.
    Allowed,
    /// Cool-down over; this call is the half-open trial call.
    Trial,
    /// Breaker open; skip the adapter.
    Rejected,
}

/// Point-in-time view of one adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterHealthSnapshot {
    /// Adapter id.
    pub id: String,
    /// Current state.
    pub state: BreakerState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct AdapterHealth {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started_at: Option<Instant>,
}

impl AdapterHealth {
    const fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started_at: None,
        }
    }
}

/// Tracks breaker state for every adapter the router knows.
pub struct HealthTracker {
    config: BreakerConfig,
    adapters: RwLock<BTreeMap<String, Mutex<AdapterHealth>>>,
}

impl HealthTracker {
    /// Create a tracker with no adapters.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            adapters: RwLock::new(BTreeMap::new()),
        }
    }

    /// Start tracking an adapter (no-op if already tracked).
    pub fn register(&self, id: &str) {
        let mut adapters = self.adapters.write().unwrap_or_else(PoisonError::into_inner);
        adapters
            .entry(id.to_string())
            .or_insert_with(|| Mutex::new(AdapterHealth::new()));
    }

    fn with_adapter<T>(&self, id: &str, f: impl FnOnce(&mut AdapterHealth) -> T) -> T {
        let adapters = self.adapters.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = adapters.get(id) {
            return f(&mut entry.lock().unwrap_or_else(PoisonError::into_inner));
        }
        drop(adapters);
        self.register(id);
        self.with_adapter(id, f)
    }

    /// Decide whether the adapter may be called now.
    pub fn admit(&self, id: &str) -> Admission {
        let cooldown = self.config.cooldown;
        self.with_adapter(id, |health| match health.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let elapsed = health.opened_at.map_or(cooldown, |at| at.elapsed());
                if elapsed >= cooldown {
                    health.state = BreakerState::HalfOpen;
                    health.trial_started_at = Some(Instant::now());
                    tracing::info!(adapter = %id, "Circuit breaker half-open, probing");
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                // A trial call abandoned mid-flight must not wedge the adapter.
                let stale = health
                    .trial_started_at
                    .map_or(true, |at| at.elapsed() >= cooldown);
                if stale {
                    health.trial_started_at = Some(Instant::now());
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
        })
    }

    /// Force a trial call on the least-recently-opened adapter among `ids`.
    ///
    /// Used when every candidate is rejected. Returns the chosen id.
    pub fn force_trial<'a>(&self, ids: &[&'a str]) -> Option<&'a str> {
        let chosen = ids.iter().copied().min_by_key(|id| {
            self.with_adapter(id, |health| health.opened_at)
        })?;

        self.with_adapter(chosen, |health| {
            health.state = BreakerState::HalfOpen;
            health.trial_started_at = Some(Instant::now());
        });
        tracing::warn!(adapter = %chosen, "All adapters open, forcing a trial call");
        Some(chosen)
    }

    /// Report a successful call.
    pub fn record_success(&self, id: &str) {
        self.with_adapter(id, |health| {
            if health.state != BreakerState::Closed {
                tracing::info!(adapter = %id, "Circuit breaker closed");
            }
            *health = AdapterHealth::new();
        });
    }

    /// Report a failed call and return the resulting state.
    pub fn record_failure(&self, id: &str) -> BreakerState {
        let threshold = self.config.failure_threshold.max(1);
        self.with_adapter(id, |health| {
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            let reopen = match health.state {
                BreakerState::Closed => health.consecutive_failures >= threshold,
                BreakerState::HalfOpen | BreakerState::Open => true,
            };
            if reopen {
                if health.state != BreakerState::Open {
                    tracing::warn!(
                        adapter = %id,
                        consecutive_failures = health.consecutive_failures,
                        "Circuit breaker opened"
                    );
                }
                health.state = BreakerState::Open;
                health.opened_at = Some(Instant::now());
                health.trial_started_at = None;
            }
            health.state
        })
    }

    /// Manually close a breaker. Returns `false` if the adapter is unknown.
    pub fn reset(&self, id: &str) -> bool {
        let adapters = self.adapters.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = adapters.get(id) else {
            return false;
        };
        *entry.lock().unwrap_or_else(PoisonError::into_inner) = AdapterHealth::new();
        tracing::info!(adapter = %id, "Circuit breaker reset");
        true
    }

    /// Current state of one adapter.
    #[must_use]
    pub fn state(&self, id: &str) -> Option<BreakerState> {
        let adapters = self.adapters.read().unwrap_or_else(PoisonError::into_inner);
        adapters
            .get(id)
            .map(|entry| entry.lock().unwrap_or_else(PoisonError::into_inner).state)
    }

    /// Snapshot of every tracked adapter, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AdapterHealthSnapshot> {
        let adapters = self.adapters.read().unwrap_or_else(PoisonError::into_inner);
        adapters
            .iter()
            .map(|(id, entry)| {
                let health = entry.lock().unwrap_or_else(PoisonError::into_inner);
                AdapterHealthSnapshot {
                    id: id.clone(),
                    state: health.state,
                    consecutive_failures: health.consecutive_failures,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracker() -> HealthTracker {
        HealthTracker::new(BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_admits_a_trial_after_cooldown() {
        let health = tracker();
        health.register("T1");

        assert_eq!(health.record_failure("T1"), BreakerState::Closed);
        assert_eq!(health.record_failure("T1"), BreakerState::Closed);
        assert_eq!(health.record_failure("T1"), BreakerState::Open);
        assert_eq!(health.admit("T1"), Admission::Rejected);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(health.admit("T1"), Admission::Rejected);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(health.admit("T1"), Admission::Trial);
        // Only one trial call in flight.
        assert_eq!(health.admit("T1"), Admission::Rejected);

        health.record_success("T1");
        assert_eq!(health.state("T1"), Some(BreakerState::Closed));
        assert_eq!(health.admit("T1"), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_restarts_cooldown() {
        let health = tracker();
        for _ in 0..3 {
            health.record_failure("T1");
        }

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(health.admit("T1"), Admission::Trial);
        assert_eq!(health.record_failure("T1"), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(health.admit("T1"), Admission::Rejected);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(health.admit("T1"), Admission::Trial);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let health = tracker();
        health.record_failure("T1");
        health.record_failure("T1");
        health.record_success("T1");
        assert_eq!(health.record_failure("T1"), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn force_trial_picks_least_recently_opened() {
        let health = tracker();
        for _ in 0..3 {
            health.record_failure("T1");
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        for _ in 0..3 {
            health.record_failure("T2");
        }

        assert_eq!(health.admit("T1"), Admission::Rejected);
        assert_eq!(health.admit("T2"), Admission::Rejected);
        assert_eq!(health.force_trial(&["T2", "T1"]), Some("T1"));
        assert_eq!(health.state("T1"), Some(BreakerState::HalfOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_reset() {
        let health = tracker();
        for _ in 0..3 {
            health.record_failure("T1");
        }
        assert!(health.reset("T1"));
        assert_eq!(health.admit("T1"), Admission::Allowed);
        assert!(!health.reset("unknown"));

        let snapshot = health.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].state, BreakerState::Closed);
        assert_eq!(snapshot[0].consecutive_failures, 0);
    }
}
