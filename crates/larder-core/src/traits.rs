use std::future::Future;
use std::time::Duration;

use crate::error::AppError;
use crate::models::{Candidate, ExtractionMethod, RawPage};
use crate::qa::QaEntry;
use crate::throttle::DomainPacer;

/// Per-call fetch settings.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Total attempts, including the first.
    pub max_retries: u32,
    /// Timeout for a single attempt.
    pub timeout: Duration,
    /// Linear backoff unit: attempt `n` waits `n * backoff` before starting.
    pub backoff: Duration,
    /// Extra headers sent on every attempt, after the rotating identity.
    pub headers: Vec<(String, String)>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(10),
            backoff: Duration::from_secs(1),
            headers: Vec::new(),
        }
    }
}

/// Fetches raw HTML (or XML) text from a URL.
///
/// The only seam allowed to perform plain HTTP I/O.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch_text(
        &self,
        url: &str,
        options: &FetchOptions,
    ) -> impl Future<Output = Result<String, AppError>> + Send;

    /// Fetch with `pacer` awaited before every request sent to the network.
    ///
    /// Fetchers that retry internally must override this so each attempt is
    /// paced; the default paces a single call.
    fn fetch_text_paced(
        &self,
        url: &str,
        options: &FetchOptions,
        pacer: &DomainPacer,
    ) -> impl Future<Output = Result<String, AppError>> + Send {
        async move {
            pacer.wait_for_url(url).await;
            self.fetch_text(url, options).await
        }
    }
}

/// Renders a page in a headless browser and returns the resulting DOM.
pub trait Renderer: Send + Sync + Clone {
    fn render(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// A renderer for pipelines without a browser. Always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRenderer;

impl Renderer for NoRenderer {
    async fn render(&self, _url: &str) -> Result<String, AppError> {
        Err(AppError::RenderError("no renderer configured".into()))
    }
}

/// Result of running one strategy against a page.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    Candidate(Candidate),
    /// Nothing recognisable on the page. Expected, not an error.
    NoMatch(String),
}

/// One extraction algorithm in the chain.
///
/// Strategies are pure: they only read the page they are given. Genuine
/// faults (malformed input the strategy cannot recover from) are `Err`.
pub trait Strategy: Send + Sync {
    /// Short identifier used in logs and exhaustion reports.
    fn name(&self) -> &'static str;

    /// Method recorded on results this strategy produces.
    fn method(&self) -> ExtractionMethod;

    fn apply(&self, page: &RawPage) -> Result<StrategyOutcome, AppError>;
}

/// Append-only destination for failed tasks.
pub trait QaSink: Send + Sync + Clone {
    fn record(&self, entry: &QaEntry) -> impl Future<Output = Result<(), AppError>> + Send;
}
