//! Per-domain circuit breaker registry.
//!
//! Stops the pipeline from hammering sites that keep failing.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[threshold failures]--> OPEN (blocked) --[cooldown]--> HALF_OPEN (one probe)
//!                                                                               |
//!                                 <--[failure]--                                |
//!                                                                               |
//! CLOSED <--------------------------------[success]-----------------------------+
//! ```
//!
//! Without a cooldown a domain stays open until a success is recorded for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Current gate position for a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected before any fetch.
    Open,
    /// Cooldown elapsed; a single probe is allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitStatus::Closed => write!(f, "closed"),
            CircuitStatus::Open => write!(f, "open"),
            CircuitStatus::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before a domain is blocked.
    pub failure_threshold: u32,

    /// Time after the last failure before one probe request is let through.
    /// `None` keeps the domain blocked until a success is recorded.
    pub cooldown: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: None,
        }
    }
}

/// Snapshot of one domain's circuit, for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitState {
    pub domain: String,
    pub consecutive_failures: u32,
    pub blocked: bool,
    pub blocked_reason: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub status: CircuitStatus,
}

#[derive(Debug)]
struct DomainCircuit {
    consecutive_failures: u32,
    blocked: bool,
    blocked_reason: Option<String>,
    last_failure_at: Option<DateTime<Utc>>,
    last_failure_instant: Option<Instant>,
    probe_in_flight: bool,
}

impl DomainCircuit {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            blocked: false,
            blocked_reason: None,
            last_failure_at: None,
            last_failure_instant: None,
            probe_in_flight: false,
        }
    }

    fn cooled_down(&self, cooldown: Option<Duration>) -> bool {
        match (cooldown, self.last_failure_instant) {
            (Some(cooldown), Some(last)) => last.elapsed() >= cooldown,
            _ => false,
        }
    }

    fn status(&self, cooldown: Option<Duration>) -> CircuitStatus {
        if !self.blocked {
            CircuitStatus::Closed
        } else if self.probe_in_flight || self.cooled_down(cooldown) {
            CircuitStatus::HalfOpen
        } else {
            CircuitStatus::Open
        }
    }
}

/// Thread-safe registry of per-domain circuits.
///
/// Clones share state. All mutations go through one mutex, so concurrent
/// failures for the same domain are never lost.
#[derive(Clone)]
pub struct CircuitRegistry {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<HashMap<String, DomainCircuit>>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.config.failure_threshold
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, HashMap<String, DomainCircuit>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned circuit registry mutex");
            poisoned.into_inner()
        })
    }

    /// Whether requests to `domain` must be rejected right now.
    ///
    /// Once the cooldown has elapsed the first caller gets `false` and becomes
    /// the probe; everyone else stays blocked until the probe is recorded.
    pub fn is_blocked(&self, domain: &str) -> bool {
        let mut map = self.lock_inner();
        let Some(circuit) = map.get_mut(domain) else {
            return false;
        };
        if !circuit.blocked {
            return false;
        }
        if !circuit.probe_in_flight && circuit.cooled_down(self.config.cooldown) {
            tracing::info!(%domain, "Circuit half-open, letting one probe through");
            circuit.probe_in_flight = true;
            return false;
        }
        true
    }

    pub fn record_failure(&self, domain: &str, reason: &str) {
        let mut map = self.lock_inner();
        let circuit = map
            .entry(domain.to_string())
            .or_insert_with(DomainCircuit::new);

        circuit.consecutive_failures += 1;
        circuit.last_failure_at = Some(Utc::now());
        circuit.last_failure_instant = Some(Instant::now());

        if circuit.probe_in_flight {
            circuit.probe_in_flight = false;
            circuit.blocked_reason = Some(reason.to_string());
            tracing::warn!(%domain, error = %reason, "Circuit probe failed, domain stays blocked");
            return;
        }

        if !circuit.blocked && circuit.consecutive_failures >= self.config.failure_threshold {
            circuit.blocked = true;
            circuit.blocked_reason = Some(reason.to_string());
            tracing::warn!(
                %domain,
                failures = circuit.consecutive_failures,
                error = %reason,
                "Circuit opening after {} consecutive failures",
                circuit.consecutive_failures
            );
        } else if circuit.blocked {
            circuit.blocked_reason = Some(reason.to_string());
        }
    }

    pub fn record_success(&self, domain: &str) {
        let mut map = self.lock_inner();
        let Some(circuit) = map.get_mut(domain) else {
            return;
        };
        if circuit.blocked {
            tracing::info!(%domain, "Circuit closing after successful request");
        }
        circuit.consecutive_failures = 0;
        circuit.blocked = false;
        circuit.blocked_reason = None;
        circuit.probe_in_flight = false;
    }

    /// Admit one request to `domain`, or `None` if the circuit is open.
    ///
    /// The permit must be resolved with the request's outcome. A permit
    /// dropped unresolved (the request was cancelled, e.g. by a task
    /// timeout) counts as a failure, which also frees the half-open slot.
    pub fn try_acquire(&self, domain: &str) -> Option<CircuitPermit> {
        if self.is_blocked(domain) {
            return None;
        }
        Some(CircuitPermit {
            registry: self.clone(),
            domain: domain.to_string(),
            resolved: false,
        })
    }

    pub fn state(&self, domain: &str) -> Option<CircuitState> {
        let map = self.lock_inner();
        map.get(domain).map(|c| self.to_state(domain, c))
    }

    /// Reason the domain was blocked, if it is.
    pub fn blocked_reason(&self, domain: &str) -> Option<String> {
        let map = self.lock_inner();
        map.get(domain)
            .filter(|c| c.blocked)
            .and_then(|c| c.blocked_reason.clone())
    }

    /// All known circuits, sorted by domain.
    pub fn snapshot(&self) -> Vec<CircuitState> {
        let map = self.lock_inner();
        let mut states: Vec<_> = map.iter().map(|(d, c)| self.to_state(d, c)).collect();
        states.sort_by(|a, b| a.domain.cmp(&b.domain));
        states
    }

    pub fn reset(&self, domain: &str) {
        tracing::info!(%domain, "Circuit manually reset");
        self.lock_inner().remove(domain);
    }

    fn to_state(&self, domain: &str, circuit: &DomainCircuit) -> CircuitState {
        CircuitState {
            domain: domain.to_string(),
            consecutive_failures: circuit.consecutive_failures,
            blocked: circuit.blocked,
            blocked_reason: circuit.blocked_reason.clone(),
            last_failure_at: circuit.last_failure_at,
            status: circuit.status(self.config.cooldown),
        }
    }
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// One admitted request, pending its outcome.
#[must_use = "an unresolved permit is recorded as a failure"]
pub struct CircuitPermit {
    registry: CircuitRegistry,
    domain: String,
    resolved: bool,
}

impl CircuitPermit {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.registry.record_success(&self.domain);
    }

    pub fn failure(mut self, reason: &str) {
        self.resolved = true;
        self.registry.record_failure(&self.domain, reason);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::warn!(domain = %self.domain, "Request abandoned before completing");
            self.registry
                .record_failure(&self.domain, "request abandoned before completing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(threshold: u32) -> CircuitRegistry {
        CircuitRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            ..Default::default()
        })
    }

    #[test]
    fn unknown_domain_is_closed() {
        let reg = registry(3);
        assert!(!reg.is_blocked("example.com"));
        assert!(reg.state("example.com").is_none());
    }

    #[test]
    fn opens_after_threshold_failures() {
        let reg = registry(3);
        for _ in 0..3 {
            reg.record_failure("example.com", "timeout");
        }
        assert!(reg.is_blocked("example.com"));

        let state = reg.state("example.com").unwrap();
        assert!(state.blocked);
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.consecutive_failures, 3);
        assert_eq!(state.blocked_reason.as_deref(), Some("timeout"));
        assert!(state.last_failure_at.is_some());
    }

    #[test]
    fn stays_closed_below_threshold() {
        let reg = registry(5);
        for _ in 0..4 {
            reg.record_failure("example.com", "timeout");
        }
        assert!(!reg.is_blocked("example.com"));
    }

    #[test]
    fn one_success_closes_the_circuit() {
        let reg = registry(5);
        for _ in 0..5 {
            reg.record_failure("example.com", "HTTP 503");
        }
        assert!(reg.is_blocked("example.com"));

        reg.record_success("example.com");
        assert!(!reg.is_blocked("example.com"));
        let state = reg.state("example.com").unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.blocked_reason, None);
    }

    #[test]
    fn success_resets_failure_count() {
        let reg = registry(5);
        for _ in 0..4 {
            reg.record_failure("example.com", "timeout");
        }
        reg.record_success("example.com");
        for _ in 0..4 {
            reg.record_failure("example.com", "timeout");
        }
        assert!(!reg.is_blocked("example.com"));
    }

    #[test]
    fn domains_are_isolated() {
        let reg = registry(1);
        reg.record_failure("broken.com", "connection refused");
        assert!(reg.is_blocked("broken.com"));
        assert!(!reg.is_blocked("healthy.com"));
    }

    #[test]
    fn cooldown_lets_a_single_probe_through() {
        let reg = CircuitRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Some(Duration::from_millis(10)),
        });
        reg.record_failure("example.com", "timeout");
        assert!(reg.is_blocked("example.com"));

        std::thread::sleep(Duration::from_millis(20));
        assert!(!reg.is_blocked("example.com"), "first caller probes");
        assert!(reg.is_blocked("example.com"), "second caller waits");
        assert_eq!(
            reg.state("example.com").unwrap().status,
            CircuitStatus::HalfOpen
        );

        reg.record_failure("example.com", "timeout again");
        assert!(reg.is_blocked("example.com"));
        assert_eq!(
            reg.blocked_reason("example.com").as_deref(),
            Some("timeout again")
        );

        std::thread::sleep(Duration::from_millis(20));
        assert!(!reg.is_blocked("example.com"));
        reg.record_success("example.com");
        assert!(!reg.is_blocked("example.com"));
        assert_eq!(
            reg.state("example.com").unwrap().status,
            CircuitStatus::Closed
        );
    }

    #[test]
    fn permit_resolves_to_success_or_failure() {
        let reg = registry(2);
        reg.try_acquire("example.com").unwrap().failure("HTTP 503");
        reg.try_acquire("example.com").unwrap().failure("HTTP 503");
        assert!(reg.try_acquire("example.com").is_none());

        reg.record_success("example.com");
        let permit = reg.try_acquire("example.com").unwrap();
        assert_eq!(permit.domain(), "example.com");
        permit.success();
        assert_eq!(reg.state("example.com").unwrap().consecutive_failures, 0);
    }

    #[test]
    fn dropped_permit_counts_as_failure() {
        let reg = registry(2);
        drop(reg.try_acquire("example.com"));
        drop(reg.try_acquire("example.com"));

        assert!(reg.is_blocked("example.com"));
        assert_eq!(
            reg.blocked_reason("example.com").as_deref(),
            Some("request abandoned before completing")
        );
    }

    #[test]
    fn dropped_half_open_request_does_not_wedge_the_domain() {
        let reg = CircuitRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Some(Duration::from_millis(10)),
        });
        reg.record_failure("example.com", "timeout");
        std::thread::sleep(Duration::from_millis(20));

        let trial = reg.try_acquire("example.com").expect("half-open request admitted");
        assert!(reg.try_acquire("example.com").is_none());
        drop(trial);

        assert!(reg.is_blocked("example.com"), "cooldown restarts");
        std::thread::sleep(Duration::from_millis(20));
        let trial = reg.try_acquire("example.com").expect("next half-open request admitted");
        trial.success();
        assert_eq!(
            reg.state("example.com").unwrap().status,
            CircuitStatus::Closed
        );
    }

    #[test]
    fn concurrent_failures_are_not_lost() {
        let reg = registry(1_000);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        reg.record_failure("example.com", "timeout");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let state = reg.state("example.com").unwrap();
        assert_eq!(state.consecutive_failures, 800);
        assert!(!state.blocked);
    }

    #[test]
    fn snapshot_and_reset() {
        let reg = registry(1);
        reg.record_failure("b.com", "x");
        reg.record_failure("a.com", "y");
        let domains: Vec<_> = reg.snapshot().into_iter().map(|s| s.domain).collect();
        assert_eq!(domains, vec!["a.com", "b.com"]);

        reg.reset("a.com");
        assert!(!reg.is_blocked("a.com"));
        assert_eq!(reg.snapshot().len(), 1);
    }
}
