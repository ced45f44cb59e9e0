//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` or atomics for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::error::AppError;
use crate::models::{
    Candidate, ExtractionMethod, ExtractionResult, RawPage, RecipeFields, RecipeTimes,
    compute_hash,
};
use crate::qa::QaEntry;
use crate::traits::{FetchOptions, Fetcher, QaSink, Renderer, Strategy, StrategyOutcome};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FetcherState {
    /// Served before anything else, one per call.
    queued: VecDeque<Result<String, AppError>>,
    pages: HashMap<String, String>,
    statuses: HashMap<String, u16>,
    default_body: Option<String>,
    calls: Vec<(String, Instant)>,
}

/// Mock fetcher with per-URL pages, queued responses and call recording.
#[derive(Clone, Default)]
pub struct MockFetcher {
    state: Arc<Mutex<FetcherState>>,
    latency: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockFetcher {
    /// Returns `html` for every URL.
    pub fn new(html: &str) -> Self {
        let fetcher = Self::default();
        fetcher.state().default_body = Some(html.to_string());
        fetcher
    }

    /// Fails the first call with `error`, then serves a default page.
    pub fn with_error(error: AppError) -> Self {
        let fetcher = Self::new("<html><body>default</body></html>");
        fetcher.state().queued.push_back(Err(error));
        fetcher
    }

    /// Serves only registered pages; anything else is a 404.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, html: &str) -> Self {
        self.state().pages.insert(url.to_string(), html.to_string());
        self
    }

    /// Every fetch of `url` fails with the given HTTP status.
    pub fn with_status(self, url: &str, status: u16) -> Self {
        self.state().statuses.insert(url.to_string(), status);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push_response(&self, response: Result<String, AppError>) {
        self.state().queued.push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.state().calls.iter().filter(|(u, _)| u == url).count()
    }

    pub fn called_urls(&self) -> Vec<String> {
        self.state().calls.iter().map(|(u, _)| u.clone()).collect()
    }

    /// Start instants of every call, in call order.
    pub fn call_times(&self) -> Vec<Instant> {
        self.state().calls.iter().map(|(_, t)| *t).collect()
    }

    /// Highest number of calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FetcherState> {
        self.state.lock().unwrap()
    }

    fn respond(&self, url: &str) -> Result<String, AppError> {
        let mut state = self.state();
        state.calls.push((url.to_string(), Instant::now()));
        if let Some(response) = state.queued.pop_front() {
            return response;
        }
        if let Some(status) = state.statuses.get(url) {
            return Err(AppError::Status {
                status: *status,
                url: url.to_string(),
            });
        }
        if let Some(html) = state.pages.get(url) {
            return Ok(html.clone());
        }
        match &state.default_body {
            Some(body) => Ok(body.clone()),
            None => Err(AppError::Status {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

impl Fetcher for MockFetcher {
    async fn fetch_text(&self, url: &str, _options: &FetchOptions) -> Result<String, AppError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let response = self.respond(url);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        response
    }
}

// ---------------------------------------------------------------------------
// MockRenderer
// ---------------------------------------------------------------------------

/// Mock renderer that returns fixed HTML.
#[derive(Clone)]
pub struct MockRenderer {
    html: Arc<Mutex<Result<String, String>>>,
    latency: Duration,
    calls: Arc<AtomicUsize>,
}

impl MockRenderer {
    pub fn new(html: &str) -> Self {
        Self {
            html: Arc::new(Mutex::new(Ok(html.to_string()))),
            latency: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            html: Arc::new(Mutex::new(Err(message.to_string()))),
            latency: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Renderer for MockRenderer {
    async fn render(&self, _url: &str) -> Result<String, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.html.lock().unwrap().clone().map_err(AppError::RenderError)
    }
}

// ---------------------------------------------------------------------------
// MockStrategy
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Behavior {
    Always(Candidate),
    WhenContains(String, Candidate),
    NoMatch,
    Fail,
}

/// Mock strategy with a fixed outcome and a call counter.
#[derive(Clone)]
pub struct MockStrategy {
    name: &'static str,
    method: ExtractionMethod,
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
}

impl MockStrategy {
    fn build(name: &'static str, method: ExtractionMethod, behavior: Behavior) -> Self {
        Self {
            name,
            method,
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always returns [`valid_candidate`].
    pub fn valid(name: &'static str, method: ExtractionMethod) -> Self {
        Self::build(name, method, Behavior::Always(valid_candidate()))
    }

    pub fn with_candidate(
        name: &'static str,
        method: ExtractionMethod,
        candidate: Candidate,
    ) -> Self {
        Self::build(name, method, Behavior::Always(candidate))
    }

    /// Returns [`valid_candidate`] only when the page HTML contains `marker`.
    pub fn valid_when_contains(
        name: &'static str,
        method: ExtractionMethod,
        marker: &str,
    ) -> Self {
        Self::build(
            name,
            method,
            Behavior::WhenContains(marker.to_string(), valid_candidate()),
        )
    }

    pub fn no_match(name: &'static str, method: ExtractionMethod) -> Self {
        Self::build(name, method, Behavior::NoMatch)
    }

    pub fn failing(name: &'static str, method: ExtractionMethod) -> Self {
        Self::build(name, method, Behavior::Fail)
    }

    pub fn arc(&self) -> Arc<dyn Strategy> {
        Arc::new(self.clone())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Strategy for MockStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn method(&self) -> ExtractionMethod {
        self.method
    }

    fn apply(&self, page: &RawPage) -> Result<StrategyOutcome, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Always(candidate) => Ok(StrategyOutcome::Candidate(candidate.clone())),
            Behavior::WhenContains(marker, candidate) if page.html.contains(marker.as_str()) => {
                Ok(StrategyOutcome::Candidate(candidate.clone()))
            }
            Behavior::WhenContains(..) | Behavior::NoMatch => {
                Ok(StrategyOutcome::NoMatch("nothing found".into()))
            }
            Behavior::Fail => Err(AppError::Strategy {
                strategy: self.name.to_string(),
                message: "malformed input".into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// FailingQaSink
// ---------------------------------------------------------------------------

/// QA sink that fails the first `failures` writes, then records.
#[derive(Clone)]
pub struct FailingQaSink {
    remaining_failures: Arc<AtomicUsize>,
    pub attempts: Arc<AtomicUsize>,
    pub entries: Arc<Mutex<Vec<QaEntry>>>,
}

impl FailingQaSink {
    pub fn new(failures: usize) -> Self {
        Self {
            remaining_failures: Arc::new(AtomicUsize::new(failures)),
            attempts: Arc::new(AtomicUsize::new(0)),
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl QaSink for FailingQaSink {
    async fn record(&self, entry: &QaEntry) -> Result<(), AppError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(AppError::Io(std::io::Error::other("disk full")));
        }
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A candidate that passes validation.
pub fn valid_candidate() -> Candidate {
    Candidate {
        title: Some("Lemon Tart".into()),
        description: None,
        ingredients: vec![
            "200g flour".into(),
            "100g butter".into(),
            "3 lemons".into(),
        ],
        instructions: vec!["Make the pastry.".into(), "Fill and bake.".into()],
        ..Default::default()
    }
}

/// A complete cached-looking result for `url`.
pub fn sample_result(url: &str) -> ExtractionResult {
    ExtractionResult {
        url: url.to_string(),
        method: ExtractionMethod::Structured,
        cached_method: None,
        rendered_via: None,
        confidence: 85,
        fields: RecipeFields {
            title: "Sample Pie".into(),
            description: Some("A pie for tests".into()),
            image_url: None,
            servings: Some("6".into()),
            times: RecipeTimes {
                total_minutes: Some(75),
                ..Default::default()
            },
            ingredients: vec!["pastry".into(), "apples".into()],
            instructions: vec!["Assemble and bake.".into()],
            author: None,
            cuisine: None,
            category: None,
        },
        processing_time_ms: 3,
        content_hash: compute_hash(url),
        extracted_at: Utc::now(),
    }
}

/// A minimal page with a JSON-LD recipe titled `title`.
pub fn json_ld_page(title: &str) -> String {
    format!(
        r#"<html><head><script type="application/ld+json">
{{"@context":"https://schema.org","@type":"Recipe","name":"{title}",
"recipeIngredient":["1 cup flour","2 eggs"],
"recipeInstructions":[{{"@type":"HowToStep","text":"Mix."}},{{"@type":"HowToStep","text":"Bake."}}]}}
</script></head><body></body></html>"#
    )
}
