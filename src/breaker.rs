//! Per-provider circuit breaking: failure tracking gates whether a request
//! may attempt a given backend at all.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures accumulated in CLOSED before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit blocks requests before a half-open trial.
    pub recovery_timeout: Duration,
    /// A failure arriving more than this long after the previous one restarts
    /// the count at 1 instead of accumulating.
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(60),
        }
    }
}

/// Point-in-time view of one provider's circuit, for observability.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    /// Remaining block time in milliseconds. `Some` only while OPEN.
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerRecord {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    /// Invariant: `Some` iff `state == Open`.
    next_retry: Option<Instant>,
}

impl BreakerRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            next_retry: None,
        }
    }
}

/// Owns one circuit record per provider id, created lazily on first
/// reference. All transitions happen under a single mutex so the
/// OPEN -> HALF_OPEN read-modify-write in [`should_allow_request`] admits
/// exactly one trial request.
///
/// [`should_allow_request`]: CircuitBreaker::should_allow_request
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    records: Mutex<HashMap<String, BreakerRecord>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a call to `provider_id` is currently permitted.
    ///
    /// Side-effecting: an OPEN circuit whose recovery timeout has elapsed
    /// transitions to HALF_OPEN here, resets its failure count, and admits
    /// this request as the trial.
    pub fn should_allow_request(&self, provider_id: &str) -> bool {
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(provider_id.to_string())
            .or_insert_with(BreakerRecord::new);

        match record.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let due = record
                    .next_retry
                    .map(|t| Instant::now() >= t)
                    .unwrap_or(true);
                if due {
                    info!(provider_id, "circuit half-open, allowing trial request");
                    record.state = CircuitState::HalfOpen;
                    record.failure_count = 0;
                    record.next_retry = None;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call. Failures decay rather than reset: a success
    /// in CLOSED decrements the count so a lone historical failure does not
    /// permanently bias selection. A success in HALF_OPEN closes the circuit.
    pub fn record_success(&self, provider_id: &str) {
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(provider_id.to_string())
            .or_insert_with(BreakerRecord::new);

        match record.state {
            CircuitState::HalfOpen => {
                info!(provider_id, "trial request succeeded, closing circuit");
                record.state = CircuitState::Closed;
                record.failure_count = 0;
                record.next_retry = None;
            }
            _ => {
                record.failure_count = record.failure_count.saturating_sub(1);
            }
        }
    }

    /// Record a failed call. Opens the circuit once `failure_threshold`
    /// failures accumulate in CLOSED, or immediately if the failure happened
    /// during a HALF_OPEN trial.
    pub fn record_failure(&self, provider_id: &str) {
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(provider_id.to_string())
            .or_insert_with(BreakerRecord::new);
        let now = Instant::now();

        match record.state {
            CircuitState::HalfOpen => {
                warn!(provider_id, "trial request failed, reopening circuit");
                record.state = CircuitState::Open;
                record.failure_count += 1;
                record.next_retry = Some(now + self.config.recovery_timeout);
            }
            CircuitState::Open => {
                // In-flight call that started before the circuit opened.
                record.failure_count += 1;
            }
            CircuitState::Closed => {
                let stale = record
                    .last_failure
                    .map(|t| now.duration_since(t) > self.config.monitoring_period)
                    .unwrap_or(false);
                record.failure_count = if stale { 1 } else { record.failure_count + 1 };
                if record.failure_count >= self.config.failure_threshold {
                    warn!(
                        provider_id,
                        failures = record.failure_count,
                        "failure threshold reached, opening circuit"
                    );
                    record.state = CircuitState::Open;
                    record.next_retry = Some(now + self.config.recovery_timeout);
                }
            }
        }
        record.last_failure = Some(now);
    }

    pub fn snapshot(&self, provider_id: &str) -> BreakerSnapshot {
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(provider_id.to_string())
            .or_insert_with(BreakerRecord::new);
        Self::snapshot_record(record)
    }

    /// Return the circuit for `provider_id` to CLOSED with no history.
    pub fn reset(&self, provider_id: &str) {
        let mut records = self.records.lock().unwrap();
        records.insert(provider_id.to_string(), BreakerRecord::new());
    }

    pub fn all_snapshots(&self) -> HashMap<String, BreakerSnapshot> {
        let records = self.records.lock().unwrap();
        records
            .iter()
            .map(|(id, record)| (id.clone(), Self::snapshot_record(record)))
            .collect()
    }

    fn snapshot_record(record: &BreakerRecord) -> BreakerSnapshot {
        let retry_after_ms = record
            .next_retry
            .map(|t| t.saturating_duration_since(Instant::now()).as_millis() as u64);
        BreakerSnapshot {
            state: record.state,
            failure_count: record.failure_count,
            retry_after_ms,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
            monitoring_period: Duration::from_secs(60),
        })
    }

    #[test]
    fn starts_closed_and_allows_requests() {
        let cb = CircuitBreaker::default();
        assert!(cb.should_allow_request("p1"));
        let snap = cb.snapshot("p1");
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert!(snap.retry_after_ms.is_none());
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = breaker(5, 60_000);
        for _ in 0..4 {
            cb.record_failure("p1");
            assert_eq!(cb.snapshot("p1").state, CircuitState::Closed);
        }
        cb.record_failure("p1");
        let snap = cb.snapshot("p1");
        assert_eq!(snap.state, CircuitState::Open);
        assert!(snap.retry_after_ms.is_some());
        assert!(!cb.should_allow_request("p1"));
    }

    #[test]
    fn success_decays_failure_count() {
        let cb = breaker(3, 60_000);
        cb.record_failure("p1");
        cb.record_failure("p1");
        cb.record_success("p1");
        assert_eq!(cb.snapshot("p1").failure_count, 1);
        // The decayed failure no longer counts toward the threshold.
        cb.record_failure("p1");
        assert_eq!(cb.snapshot("p1").state, CircuitState::Closed);
        cb.record_failure("p1");
        assert_eq!(cb.snapshot("p1").state, CircuitState::Open);
    }

    #[test]
    fn failure_count_floors_at_zero() {
        let cb = breaker(3, 60_000);
        cb.record_success("p1");
        cb.record_success("p1");
        assert_eq!(cb.snapshot("p1").failure_count, 0);
    }

    #[test]
    fn open_transitions_to_half_open_after_recovery_timeout() {
        let cb = breaker(2, 20);
        cb.record_failure("p1");
        cb.record_failure("p1");
        assert!(!cb.should_allow_request("p1"));

        sleep(Duration::from_millis(25));
        // The next permission check performs the transition and admits the trial.
        assert!(cb.should_allow_request("p1"));
        let snap = cb.snapshot("p1");
        assert_eq!(snap.state, CircuitState::HalfOpen);
        assert_eq!(snap.failure_count, 0);
        assert!(snap.retry_after_ms.is_none());
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_timeout() {
        let cb = breaker(2, 20);
        cb.record_failure("p1");
        cb.record_failure("p1");
        sleep(Duration::from_millis(25));
        assert!(cb.should_allow_request("p1"));

        cb.record_failure("p1");
        assert_eq!(cb.snapshot("p1").state, CircuitState::Open);
        // The new deadline is measured from the trial failure, not the
        // original opening, so the circuit blocks again for a full timeout.
        assert!(!cb.should_allow_request("p1"));
        sleep(Duration::from_millis(25));
        assert!(cb.should_allow_request("p1"));
    }

    #[test]
    fn half_open_success_closes_circuit() {
        let cb = breaker(2, 20);
        cb.record_failure("p1");
        cb.record_failure("p1");
        sleep(Duration::from_millis(25));
        assert!(cb.should_allow_request("p1"));

        cb.record_success("p1");
        let snap = cb.snapshot("p1");
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert!(snap.retry_after_ms.is_none());
        assert!(cb.should_allow_request("p1"));
    }

    #[test]
    fn stale_failure_restarts_count() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_millis(10),
        });
        cb.record_failure("p1");
        sleep(Duration::from_millis(15));
        // The old failure fell outside the monitoring period.
        cb.record_failure("p1");
        let snap = cb.snapshot("p1");
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 1);
    }

    #[test]
    fn reset_returns_tripped_breaker_to_closed() {
        let cb = breaker(1, 60_000);
        cb.record_failure("p1");
        assert!(!cb.should_allow_request("p1"));
        cb.reset("p1");
        let snap = cb.snapshot("p1");
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert!(cb.should_allow_request("p1"));
    }

    #[test]
    fn records_are_independent_per_provider() {
        let cb = breaker(1, 60_000);
        cb.record_failure("p1");
        assert!(!cb.should_allow_request("p1"));
        assert!(cb.should_allow_request("p2"));

        let all = cb.all_snapshots();
        assert_eq!(all.len(), 2);
        assert_eq!(all["p1"].state, CircuitState::Open);
        assert_eq!(all["p2"].state, CircuitState::Closed);
    }
}
