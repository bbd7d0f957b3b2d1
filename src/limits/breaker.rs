//! Per-component circuit breakers with closed/open/half-open states.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub trip_count: u32,
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trip_count: u32,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trip_count: 0,
        }
    }
}

/// Named breakers with independent counters. `failure_threshold`
/// consecutive failures trip a breaker open; after `reset_timeout` the next
/// `allow` admits one trial call (half-open). Trial success closes, trial
/// failure re-opens.
pub struct CircuitBreakerSet {
    breakers: DashMap<String, Breaker>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreakerSet {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold,
            reset_timeout,
        }
    }

    pub fn allow(&self, component: &str) -> bool {
        let mut entry = self
            .breakers
            .entry(component.to_string())
            .or_insert_with(Breaker::new);

        match entry.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.reset_timeout {
                    entry.state = BreakerState::HalfOpen;
                    info!(component, "Circuit half-open, admitting trial call");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record(&self, component: &str, outcome: BreakerOutcome) {
        let mut entry = self
            .breakers
            .entry(component.to_string())
            .or_insert_with(Breaker::new);

        match (entry.state, outcome) {
            (BreakerState::HalfOpen, BreakerOutcome::Success) => {
                entry.state = BreakerState::Closed;
                entry.consecutive_failures = 0;
                entry.opened_at = None;
                info!(component, "Circuit closed after trial success");
            }
            (BreakerState::HalfOpen, BreakerOutcome::Failure) => {
                entry.state = BreakerState::Open;
                entry.opened_at = Some(Instant::now());
                entry.trip_count += 1;
                warn!(component, "Circuit re-opened after trial failure");
            }
            (BreakerState::Closed, BreakerOutcome::Success) => {
                entry.consecutive_failures = 0;
            }
            (BreakerState::Closed, BreakerOutcome::Failure) => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.failure_threshold {
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(Instant::now());
                    entry.trip_count += 1;
                    warn!(
                        component,
                        failures = entry.consecutive_failures,
                        "Circuit tripped open"
                    );
                }
            }
            // Calls admitted before the trip are still being recorded.
            (BreakerState::Open, BreakerOutcome::Failure) => {
                entry.consecutive_failures += 1;
            }
            (BreakerState::Open, BreakerOutcome::Success) => {}
        }
    }

    pub fn state(&self, component: &str) -> BreakerState {
        self.breakers
            .get(component)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn summary(&self) -> HashMap<String, BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    BreakerSnapshot {
                        state: entry.state,
                        consecutive_failures: entry.consecutive_failures,
                        trip_count: entry.trip_count,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold_consecutive_failures() {
        let set = CircuitBreakerSet::new(3, Duration::from_secs(60));

        assert!(set.allow("green_branch"));
        set.record("green_branch", BreakerOutcome::Failure);
        set.record("green_branch", BreakerOutcome::Failure);
        assert!(set.allow("green_branch"));
        assert_eq!(set.state("green_branch"), BreakerState::Closed);

        set.record("green_branch", BreakerOutcome::Failure);
        assert_eq!(set.state("green_branch"), BreakerState::Open);
        assert!(!set.allow("green_branch"));
    }

    #[test]
    fn success_resets_consecutive_count() {
        let set = CircuitBreakerSet::new(3, Duration::from_secs(60));

        set.record("worker", BreakerOutcome::Failure);
        set.record("worker", BreakerOutcome::Failure);
        set.record("worker", BreakerOutcome::Success);
        set.record("worker", BreakerOutcome::Failure);
        set.record("worker", BreakerOutcome::Failure);
        assert_eq!(set.state("worker"), BreakerState::Closed);
    }

    #[test]
    fn half_open_trial_closes_or_reopens() {
        let set = CircuitBreakerSet::new(1, Duration::from_millis(0));

        set.record("push", BreakerOutcome::Failure);
        assert_eq!(set.state("push"), BreakerState::Open);

        // Zero reset timeout: next allow is the trial call.
        assert!(set.allow("push"));
        assert_eq!(set.state("push"), BreakerState::HalfOpen);
        set.record("push", BreakerOutcome::Failure);
        assert_eq!(set.state("push"), BreakerState::Open);

        assert!(set.allow("push"));
        set.record("push", BreakerOutcome::Success);
        assert_eq!(set.state("push"), BreakerState::Closed);
    }

    #[test]
    fn components_are_independent() {
        let set = CircuitBreakerSet::new(1, Duration::from_secs(60));

        set.record("green_branch", BreakerOutcome::Failure);
        assert!(!set.allow("green_branch"));
        assert!(set.allow("worker"));

        let summary = set.summary();
        assert_eq!(summary["green_branch"].state, BreakerState::Open);
        assert_eq!(summary["green_branch"].trip_count, 1);
        assert_eq!(summary["worker"].state, BreakerState::Closed);
    }
}
