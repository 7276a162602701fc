// Per-target circuit breaker
// Closed until the failure threshold, open until the reset time, then closed again

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Attempts allowed
    Closed,
    /// Attempts refused until the given time
    Open { until: DateTime<Utc> },
    /// Reset time elapsed; the next attempt clears the breaker
    Expired,
}

/// Breaker fields persisted with each integration record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
    pub consecutive_failures: u32,

    pub circuit_open_until: Option<DateTime<Utc>>,

    pub last_successful_heal: Option<DateTime<Utc>>,
}

impl BreakerState {
    pub fn state(&self, now: DateTime<Utc>) -> CircuitState {
        match self.circuit_open_until {
            Some(until) if until > now => CircuitState::Open { until },
            Some(_) => CircuitState::Expired,
            None => CircuitState::Closed,
        }
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state(now), CircuitState::Open { .. })
    }

    /// Clear an elapsed breaker; returns true when it transitioned
    ///
    /// No canary probe: the next attempt is treated as a normal attempt.
    pub fn try_close(&mut self, now: DateTime<Utc>) -> bool {
        if self.state(now) != CircuitState::Expired {
            return false;
        }
        info!(failures = self.consecutive_failures, "circuit breaker reset elapsed - closing");
        self.circuit_open_until = None;
        self.consecutive_failures = 0;
        true
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.circuit_open_until = None;
        self.last_successful_heal = Some(now);
    }

    /// Count a failure; returns the reset time when this failure opened the breaker
    pub fn record_failure(&mut self, now: DateTime<Utc>, threshold: u32, reset: Duration) -> Option<DateTime<Utc>> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures >= threshold && self.circuit_open_until.is_none() {
            let until = now + reset;
            warn!(
                failures = self.consecutive_failures,
                threshold,
                until = %until,
                "circuit breaker opening - target unreliable"
            );
            self.circuit_open_until = Some(until);
            return Some(until);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker_opens_after_failures() {
        let now = Utc::now();
        let reset = Duration::seconds(600);
        let mut breaker = BreakerState::default();

        assert!(breaker.record_failure(now, 3, reset).is_none());
        assert!(breaker.record_failure(now, 3, reset).is_none());
        let until = breaker.record_failure(now, 3, reset).unwrap();

        assert_eq!(until, now + reset);
        assert!(breaker.is_open(now + Duration::seconds(599)));
        assert_eq!(breaker.state(now), CircuitState::Open { until });
    }

    #[test]
    fn test_circuit_breaker_closes_after_reset() {
        let now = Utc::now();
        let mut breaker = BreakerState::default();
        breaker.record_failure(now, 1, Duration::seconds(60));

        assert!(!breaker.try_close(now + Duration::seconds(59)));
        assert_eq!(breaker.state(now + Duration::seconds(60)), CircuitState::Expired);
        assert!(breaker.try_close(now + Duration::seconds(60)));
        assert_eq!(breaker.consecutive_failures, 0);
        assert_eq!(breaker.state(now + Duration::seconds(60)), CircuitState::Closed);
    }

    #[test]
    fn test_success_resets_failures() {
        let now = Utc::now();
        let mut breaker = BreakerState::default();
        breaker.record_failure(now, 5, Duration::seconds(60));
        breaker.record_failure(now, 5, Duration::seconds(60));
        breaker.record_success(now);

        assert_eq!(breaker.consecutive_failures, 0);
        assert_eq!(breaker.last_successful_heal, Some(now));
    }
}
