//! Per-domain request pacing for polite fetching.
//!
//! Wraps any [`Fetcher`] so that successive requests to the same domain start
//! at least `delay` apart, no matter how many tasks run concurrently. Retrying
//! fetchers pace every attempt through [`Fetcher::fetch_text_paced`]. Each
//! domain has its own lock, so waiters on one domain never hold up requests
//! to other domains.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use larder_core::throttle::{PacedFetcher, ThrottleConfig};
//!
//! # use larder_core::traits::{Fetcher, FetchOptions};
//! # #[derive(Clone)] struct MyFetcher;
//! # impl Fetcher for MyFetcher {
//! #     async fn fetch_text(&self, _: &str, _: &FetchOptions) -> Result<String, larder_core::error::AppError> { todo!() }
//! # }
//! let config = ThrottleConfig::new(Duration::from_secs(1))
//!     .with_jitter(Duration::from_millis(500));
//! let fetcher = PacedFetcher::new(MyFetcher, config);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

use crate::error::AppError;
use crate::models::domain_of;
use crate::traits::{FetchOptions, Fetcher};

/// Configuration for per-domain pacing.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum delay between consecutive request starts to the same domain.
    pub delay: Duration,

    /// Maximum random jitter added on top of `delay` (uniform [0, jitter]).
    ///
    /// Set to `Duration::ZERO` to disable.
    pub jitter: Duration,
}

impl ThrottleConfig {
    /// Create a new config with the given per-domain delay and no jitter.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
        }
    }

    /// Add random jitter (uniform [0, jitter]) on top of the base delay.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Compute the effective delay for a single wait (delay + random jitter).
    fn effective_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let jitter_ms = rand_jitter_ms(self.jitter.as_millis() as u64);
        self.delay + Duration::from_millis(jitter_ms)
    }
}

impl Default for ThrottleConfig {
    /// 1 second delay, no jitter.
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

type DomainSlot = Arc<AsyncMutex<Option<Instant>>>;

/// Serializes request starts per domain.
#[derive(Clone)]
pub struct DomainPacer {
    config: ThrottleConfig,
    /// Start time of the most recent request, per domain.
    domains: Arc<Mutex<HashMap<String, DomainSlot>>>,
}

impl DomainPacer {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            domains: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn delay(&self) -> Duration {
        self.config.delay
    }

    fn slot(&self, domain: &str) -> DomainSlot {
        let mut map = self.domains.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(domain.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    /// Wait until this caller may start a request to `domain`.
    ///
    /// Callers for the same domain queue on that domain's lock in arrival
    /// order; the lock is held across the sleep and the start time recorded
    /// after it, so consecutive starts are at least `delay` apart.
    pub async fn wait(&self, domain: &str) {
        let slot = self.slot(domain);
        let mut last = slot.lock().await;

        if let Some(previous) = *last {
            let ready_at = previous + self.config.effective_delay();
            let now = Instant::now();
            if ready_at > now {
                tracing::debug!(
                    %domain,
                    sleep_ms = %(ready_at - now).as_millis(),
                    "Pacing request"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Wait for the domain of `url`. URLs without a host are not paced.
    pub async fn wait_for_url(&self, url: &str) {
        if let Some(domain) = domain_of(url) {
            self.wait(&domain).await;
        }
    }
}

/// A [`Fetcher`] wrapper that enforces per-domain pacing.
#[derive(Clone)]
pub struct PacedFetcher<F> {
    inner: F,
    pacer: DomainPacer,
}

impl<F: Fetcher> PacedFetcher<F> {
    pub fn new(inner: F, config: ThrottleConfig) -> Self {
        Self::with_pacer(inner, DomainPacer::new(config))
    }

    /// Wrap a fetcher with an existing (possibly shared) pacer.
    pub fn with_pacer(inner: F, pacer: DomainPacer) -> Self {
        Self { inner, pacer }
    }

    pub fn pacer(&self) -> &DomainPacer {
        &self.pacer
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: Fetcher> Fetcher for PacedFetcher<F> {
    async fn fetch_text(&self, url: &str, options: &FetchOptions) -> Result<String, AppError> {
        self.inner.fetch_text_paced(url, options, &self.pacer).await
    }
}

// Jitter from a xorshift seeded by the clock; not crypto, just spread.
fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}
