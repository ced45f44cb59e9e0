//! Batch controller: drives URL lists through the pipeline.
//!
//! Per task: cache lookup, circuit check, paced fetch, extraction chain,
//! usability check, cache write. Tasks run in sequential batches; inside a
//! batch a bounded pool (`buffer_unordered`) keeps at most `concurrency`
//! tasks in flight. A failing task never aborts the run.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use uuid::Uuid;

use crate::cache::RecipeCache;
use crate::chain::ExtractionChain;
use crate::circuit_breaker::CircuitRegistry;
use crate::error::AppError;
use crate::models::{
    BatchRunStats, ExtractionMethod, ExtractionRequest, ExtractionResult, RawPage, TaskError,
    domain_of,
};
use crate::qa::{MemoryQaSink, QaEntry};
use crate::throttle::PacedFetcher;
use crate::traits::{FetchOptions, Fetcher, NoRenderer, QaSink, Renderer};
use crate::validate::check_usable;

/// Pool and pacing settings for one run.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Maximum tasks in flight inside a batch.
    pub concurrency: usize,
    /// URLs per sequential batch.
    pub batch_size: usize,
    /// Pause after each task before its slot is released.
    pub inter_task_delay: Duration,
    /// Wall-clock bound on a whole task (fetch retries plus extraction).
    pub task_timeout: Option<Duration>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            batch_size: 50,
            inter_task_delay: Duration::from_millis(250),
            task_timeout: None,
        }
    }
}

/// Events emitted by the batch controller for monitoring/logging.
#[derive(Debug, Clone)]
pub enum BatchEvent<'a> {
    RunStarted {
        run_id: Uuid,
        total: usize,
        batches: usize,
    },
    BatchStarted {
        index: usize,
        batches: usize,
        size: usize,
    },
    TaskSucceeded {
        url: &'a str,
        method: ExtractionMethod,
        cache_hit: bool,
    },
    TaskFailed {
        url: &'a str,
        kind: &'a str,
        error: &'a str,
    },
    BatchCompleted {
        index: usize,
        batches: usize,
        processed: usize,
        successful: usize,
        failed: usize,
    },
    RunCompleted {
        stats: &'a BatchRunStats,
    },
}

/// Trait for receiving batch events (decoupled logging).
pub trait BatchReporter: Send + Sync {
    fn report(&self, event: BatchEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBatchReporter;

impl BatchReporter for TracingBatchReporter {
    fn report(&self, event: BatchEvent<'_>) {
        match event {
            BatchEvent::RunStarted {
                run_id,
                total,
                batches,
            } => {
                tracing::info!(%run_id, %total, %batches, "Batch run started");
            }
            BatchEvent::BatchStarted {
                index,
                batches,
                size,
            } => {
                tracing::debug!(batch = index + 1, %batches, %size, "Starting batch");
            }
            BatchEvent::TaskSucceeded {
                url,
                method,
                cache_hit,
            } => {
                tracing::debug!(%url, %method, %cache_hit, "Task succeeded");
            }
            BatchEvent::TaskFailed { url, kind, error } => {
                tracing::warn!(%url, %kind, %error, "Task failed");
            }
            BatchEvent::BatchCompleted {
                index,
                batches,
                processed,
                successful,
                failed,
            } => {
                tracing::info!(
                    batch = index + 1,
                    %batches,
                    %processed,
                    %successful,
                    %failed,
                    "Batch {}/{} complete",
                    index + 1,
                    batches
                );
            }
            BatchEvent::RunCompleted { stats } => {
                tracing::info!(
                    run_id = %stats.run_id,
                    total = stats.total_processed,
                    successful = stats.successful,
                    failed = stats.failed,
                    cache_hits = stats.cache_hits,
                    duration_ms = stats.duration_ms,
                    "Batch run complete ({:.1}% success)",
                    stats.success_rate * 100.0
                );
            }
        }
    }
}

struct TaskSuccess {
    result: ExtractionResult,
    cache_hit: bool,
}

/// Drives URLs through cache, circuit registry, fetcher and extraction chain.
pub struct BatchController<F, R = NoRenderer, Q = MemoryQaSink> {
    fetcher: PacedFetcher<F>,
    chain: ExtractionChain<R>,
    cache: RecipeCache,
    circuits: CircuitRegistry,
    qa: Q,
    fetch_options: FetchOptions,
    cache_ttl: Duration,
    /// QA entries the sink refused twice, retried after each batch.
    qa_pending: Mutex<Vec<QaEntry>>,
}

impl<F, R, Q> BatchController<F, R, Q>
where
    F: Fetcher,
    R: Renderer,
    Q: QaSink,
{
    pub fn new(fetcher: PacedFetcher<F>, chain: ExtractionChain<R>, qa: Q) -> Self {
        let cache = RecipeCache::default();
        let cache_ttl = cache.default_ttl();
        Self {
            fetcher,
            chain,
            cache,
            circuits: CircuitRegistry::default(),
            qa,
            fetch_options: FetchOptions::default(),
            cache_ttl,
            qa_pending: Mutex::new(Vec::new()),
        }
    }

    /// Share an existing cache. Its default TTL becomes the write TTL.
    pub fn with_cache(mut self, cache: RecipeCache) -> Self {
        self.cache_ttl = cache.default_ttl();
        self.cache = cache;
        self
    }

    pub fn with_circuits(mut self, circuits: CircuitRegistry) -> Self {
        self.circuits = circuits;
        self
    }

    pub fn with_fetch_options(mut self, options: FetchOptions) -> Self {
        self.fetch_options = options;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn cache(&self) -> &RecipeCache {
        &self.cache
    }

    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    pub fn qa_sink(&self) -> &Q {
        &self.qa
    }

    /// Run one URL through the pipeline.
    ///
    /// A cache hit returns the stored result unchanged.
    pub async fn extract_one(&self, url: &str) -> Result<ExtractionResult, AppError> {
        self.process(&ExtractionRequest::new(url))
            .await
            .map(|success| success.result)
    }

    /// Process every URL with the default tracing reporter.
    pub async fn run(&self, urls: &[String], options: &BatchOptions) -> BatchRunStats {
        self.run_with_reporter(urls, options, &TracingBatchReporter)
            .await
    }

    pub async fn run_with_reporter(
        &self,
        urls: &[String],
        options: &BatchOptions,
        reporter: &dyn BatchReporter,
    ) -> BatchRunStats {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let batch_size = options.batch_size.max(1);
        let concurrency = options.concurrency.max(1);
        let batches = urls.len().div_ceil(batch_size);

        reporter.report(BatchEvent::RunStarted {
            run_id,
            total: urls.len(),
            batches,
        });

        let mut successful_results = Vec::new();
        let mut errors = Vec::new();
        let mut error_breakdown: BTreeMap<String, usize> = BTreeMap::new();
        let mut cache_hits = 0;

        for (index, chunk) in urls.chunks(batch_size).enumerate() {
            reporter.report(BatchEvent::BatchStarted {
                index,
                batches,
                size: chunk.len(),
            });

            let outcomes: Vec<(&String, Result<TaskSuccess, AppError>)> = stream::iter(chunk)
                .map(|url| async move {
                    let outcome = self.run_task(url, options).await;
                    if !options.inter_task_delay.is_zero() {
                        tokio::time::sleep(options.inter_task_delay).await;
                    }
                    (url, outcome)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

            let (mut batch_ok, mut batch_failed) = (0, 0);
            for (url, outcome) in outcomes {
                match outcome {
                    Ok(success) => {
                        batch_ok += 1;
                        reporter.report(BatchEvent::TaskSucceeded {
                            url,
                            method: success.result.method,
                            cache_hit: success.cache_hit,
                        });
                        if success.cache_hit {
                            cache_hits += 1;
                            successful_results.push(success.result.as_cache_hit());
                        } else {
                            successful_results.push(success.result);
                        }
                    }
                    Err(e) => {
                        batch_failed += 1;
                        let error = e.to_string();
                        reporter.report(BatchEvent::TaskFailed {
                            url,
                            kind: e.kind(),
                            error: &error,
                        });
                        *error_breakdown.entry(e.kind().to_string()).or_default() += 1;
                        errors.push(TaskError {
                            url: url.clone(),
                            error,
                            kind: e.kind().to_string(),
                        });
                    }
                }
            }

            self.flush_pending_qa().await;
            reporter.report(BatchEvent::BatchCompleted {
                index,
                batches,
                processed: successful_results.len() + errors.len(),
                successful: batch_ok,
                failed: batch_failed,
            });
        }

        let undelivered_qa = self.take_pending_qa();
        if !undelivered_qa.is_empty() {
            tracing::error!(
                count = undelivered_qa.len(),
                "QA entries could not be written; returning them with the run stats"
            );
        }

        let successful = successful_results.len();
        let failed = errors.len();
        let total_processed = successful + failed;
        let success_rate = if total_processed == 0 {
            0.0
        } else {
            successful as f64 / total_processed as f64
        };

        let stats = BatchRunStats {
            run_id,
            total_processed,
            successful,
            failed,
            success_rate,
            duration_ms: started.elapsed().as_millis() as u64,
            cache_hits,
            errors,
            error_breakdown,
            successful_results,
            undelivered_qa,
        };
        reporter.report(BatchEvent::RunCompleted { stats: &stats });
        stats
    }

    /// One task: bounded by the task timeout, failures routed to the QA sink.
    async fn run_task(&self, url: &str, options: &BatchOptions) -> Result<TaskSuccess, AppError> {
        let mut request = ExtractionRequest::new(url);
        if let Some(limit) = options.task_timeout {
            request = request.with_deadline(Instant::now() + limit);
        }
        request.attempt_count += 1;

        let outcome = match request.deadline {
            Some(deadline) => {
                let deadline = tokio::time::Instant::from_std(deadline);
                match tokio::time::timeout_at(deadline, self.process(&request)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(AppError::Timeout(
                        options.task_timeout.unwrap_or_default().as_millis() as u64,
                    )),
                }
            }
            None => self.process(&request).await,
        };

        if let Err(e) = &outcome {
            self.record_qa(url, e).await;
        }
        outcome
    }

    async fn process(&self, request: &ExtractionRequest) -> Result<TaskSuccess, AppError> {
        let url = request.url.as_str();
        if let Some(result) = self.cache.get(url).await {
            tracing::debug!(%url, "Cache hit");
            return Ok(TaskSuccess {
                result,
                cache_hit: true,
            });
        }

        let permit = match domain_of(url) {
            Some(domain) => match self.circuits.try_acquire(&domain) {
                Some(permit) => Some(permit),
                None => {
                    let reason = self
                        .circuits
                        .blocked_reason(&domain)
                        .unwrap_or_else(|| "too many consecutive failures".to_string());
                    return Err(AppError::CircuitOpen { domain, reason });
                }
            },
            None => None,
        };

        // Cancelling the fetch drops the permit unresolved, which counts as a failure.
        let html = match self.fetcher.fetch_text(url, &self.fetch_options).await {
            Ok(html) => {
                if let Some(permit) = permit {
                    permit.success();
                }
                html
            }
            Err(e) => {
                if let Some(permit) = permit {
                    if e.should_trip_circuit() {
                        permit.failure(&e.to_string());
                    } else {
                        // The site answered; only the page is bad.
                        permit.success();
                    }
                }
                return Err(e);
            }
        };

        let result = self.chain.extract(&RawPage::http(url, html)).await?;
        check_usable(&result.fields)?;

        self.cache.set(url, result.clone(), self.cache_ttl).await;
        Ok(TaskSuccess {
            result,
            cache_hit: false,
        })
    }

    /// Write a QA entry, retrying once. Sink failures are logged, never raised;
    /// an entry refused twice is kept for [`Self::flush_pending_qa`].
    async fn record_qa(&self, url: &str, error: &AppError) {
        let entry = QaEntry::from_error(url, error);
        if let Err(first) = self.qa.record(&entry).await {
            tracing::error!(%url, error = %first, "QA sink write failed, retrying");
            if let Err(second) = self.qa.record(&entry).await {
                tracing::error!(%url, error = %second, "QA sink write failed twice, keeping entry");
                self.lock_pending().push(entry);
            }
        }
    }

    /// One more delivery attempt for every held-back QA entry.
    async fn flush_pending_qa(&self) {
        let pending = self.take_pending_qa();
        if pending.is_empty() {
            return;
        }
        let mut still_pending = Vec::new();
        for entry in pending {
            if let Err(e) = self.qa.record(&entry).await {
                tracing::error!(url = %entry.url, error = %e, "QA sink still failing");
                still_pending.push(entry);
            }
        }
        self.lock_pending().extend(still_pending);
    }

    fn take_pending_qa(&self) -> Vec<QaEntry> {
        std::mem::take(&mut *self.lock_pending())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<QaEntry>> {
        self.qa_pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::cache::CacheConfig;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::testutil::{FailingQaSink, MockFetcher, MockStrategy};
    use crate::throttle::ThrottleConfig;
    use crate::traits::Strategy;

    fn strategies() -> Vec<Arc<dyn Strategy>> {
        vec![MockStrategy::valid("json_ld", ExtractionMethod::Structured).arc()]
    }

    fn controller(
        mock: &MockFetcher,
        pacing: Duration,
    ) -> BatchController<MockFetcher, NoRenderer, MemoryQaSink> {
        BatchController::new(
            PacedFetcher::new(mock.clone(), ThrottleConfig::new(pacing)),
            ExtractionChain::new(strategies()),
            MemoryQaSink::new(),
        )
    }

    fn fast() -> BatchOptions {
        BatchOptions {
            concurrency: 5,
            batch_size: 50,
            inter_task_delay: Duration::ZERO,
            task_timeout: None,
        }
    }

    fn urls(n: usize, host: &str) -> Vec<String> {
        (0..n).map(|i| format!("https://{host}/recipes/{i}")).collect()
    }

    #[tokio::test]
    async fn tolerates_partial_failure() {
        let urls = urls(10, "a.test");
        let mock = MockFetcher::new("<html></html>")
            .with_status(&urls[2], 404)
            .with_status(&urls[5], 404)
            .with_status(&urls[9], 410);
        let controller = controller(&mock, Duration::ZERO);

        let stats = controller.run(&urls, &fast()).await;

        assert_eq!(stats.total_processed, 10);
        assert_eq!(stats.successful, 7);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.errors.len(), 3);
        assert_eq!(stats.successful_results.len(), 7);
        assert!((stats.success_rate - 0.7).abs() < f64::EPSILON);
        assert_eq!(stats.error_breakdown.get("fetch"), Some(&3));
        assert_eq!(controller.qa_sink().len(), 3);
        assert!(!controller.circuits().is_blocked("a.test"));
    }

    #[tokio::test]
    async fn tolerates_pages_without_a_recipe() {
        let urls = urls(10, "a.test");
        let mut mock = MockFetcher::empty();
        for (i, url) in urls.iter().enumerate() {
            let html = if [1, 4, 8].contains(&i) {
                "<html><body><p>Subscribe to our newsletter</p></body></html>"
            } else {
                "<html><body><div class=\"recipe-card\"></div></body></html>"
            };
            mock = mock.with_page(url, html);
        }
        let mut thin = crate::testutil::valid_candidate();
        thin.ingredients.truncate(1);
        let controller = BatchController::new(
            PacedFetcher::new(mock, ThrottleConfig::new(Duration::ZERO)),
            ExtractionChain::new(vec![
                MockStrategy::valid_when_contains("json_ld", ExtractionMethod::Structured, "recipe-card")
                    .arc(),
                MockStrategy::with_candidate("generic", ExtractionMethod::Generic, thin).arc(),
            ]),
            MemoryQaSink::new(),
        );

        let stats = controller.run(&urls, &fast()).await;

        assert_eq!(stats.total_processed, 10);
        assert_eq!(stats.successful, 7);
        assert_eq!(stats.failed, 3);
        assert!((stats.success_rate - 0.7).abs() < f64::EPSILON);
        assert_eq!(stats.error_breakdown.get("extraction_exhausted"), Some(&3));

        let mut failed: Vec<_> = stats.errors.iter().map(|e| e.url.clone()).collect();
        failed.sort();
        assert_eq!(failed, vec![urls[1].clone(), urls[4].clone(), urls[8].clone()]);

        let entries = controller.qa_sink().entries();
        assert_eq!(entries.len(), 3);
        for entry in &entries {
            assert_eq!(entry.kind, "extraction_exhausted");
            let partial = entry.partial_data.as_ref().expect("partial candidate recorded");
            assert_eq!(partial["title"], "Lemon Tart");
            assert_eq!(partial["ingredients"].as_array().map(Vec::len), Some(1));
        }
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_bound() {
        for n in [1, 5, 50] {
            let mock = MockFetcher::new("<html></html>").with_latency(Duration::from_millis(30));
            let controller = controller(&mock, Duration::ZERO);
            let options = BatchOptions {
                concurrency: n,
                batch_size: 100,
                ..fast()
            };

            let stats = controller.run(&urls(60, "a.test"), &options).await;

            assert_eq!(stats.successful, 60);
            assert!(
                mock.max_in_flight() <= n,
                "concurrency {n}: saw {} in flight",
                mock.max_in_flight()
            );
            assert_eq!(mock.max_in_flight(), n);
        }
    }

    #[tokio::test]
    async fn paces_fetches_to_one_domain() {
        let mock = MockFetcher::new("<html></html>");
        let controller = controller(&mock, Duration::from_millis(200));

        let stats = controller.run(&urls(5, "a.test"), &fast()).await;
        assert_eq!(stats.successful, 5);

        let mut starts = mock.call_times();
        starts.sort();
        for pair in starts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_millis(199), "starts only {gap:?} apart");
        }
    }

    #[tokio::test]
    async fn second_run_is_served_from_cache() {
        let mock = MockFetcher::new("<html></html>");
        let controller = controller(&mock, Duration::ZERO);
        let urls = urls(4, "a.test");

        let first = controller.run(&urls, &fast()).await;
        assert_eq!(mock.call_count(), 4);
        let second = controller.run(&urls, &fast()).await;

        assert_eq!(mock.call_count(), 4);
        assert_eq!(second.successful, 4);
        assert_eq!(second.cache_hits, 4);
        assert!(
            second
                .successful_results
                .iter()
                .all(|r| r.method == ExtractionMethod::Cache
                    && r.cached_method == Some(ExtractionMethod::Structured))
        );

        let mut a: Vec<_> = first.successful_results.iter().map(|r| r.fields.clone()).collect();
        let mut b: Vec<_> = second.successful_results.iter().map(|r| r.fields.clone()).collect();
        a.sort_by(|x, y| x.title.cmp(&y.title));
        b.sort_by(|x, y| x.title.cmp(&y.title));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn extract_one_is_idempotent_within_ttl() {
        let mock = MockFetcher::new("<html></html>");
        let controller = controller(&mock, Duration::ZERO);
        let url = "https://a.test/recipes/tart?utm_source=feed";

        let first = controller.extract_one(url).await.unwrap();
        let second = controller
            .extract_one("https://A.test/recipes/tart/")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn expired_cache_entries_are_refetched() {
        let mock = MockFetcher::new("<html></html>");
        let controller = controller(&mock, Duration::ZERO).with_cache(RecipeCache::new(CacheConfig {
            default_ttl: Duration::from_millis(20),
            ..Default::default()
        }));

        controller.extract_one("https://a.test/recipes/x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        controller.extract_one("https://a.test/recipes/x").await.unwrap();

        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn open_circuit_skips_fetch() {
        let mock = MockFetcher::new("<html></html>");
        let circuits = CircuitRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown: None,
        });
        circuits.record_failure("a.test", "HTTP 503");
        circuits.record_failure("a.test", "HTTP 503");
        let controller = controller(&mock, Duration::ZERO).with_circuits(circuits);

        let stats = controller.run(&urls(3, "a.test"), &fast()).await;

        assert_eq!(mock.call_count(), 0);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.error_breakdown.get("circuit_open"), Some(&3));
        assert!(stats.errors[0].error.contains("HTTP 503"));
    }

    #[tokio::test]
    async fn broken_domain_trips_circuit_mid_run() {
        let urls = urls(5, "down.test");
        let mut mock = MockFetcher::empty();
        for url in &urls {
            mock = mock.with_status(url, 503);
        }
        let controller = controller(&mock, Duration::ZERO).with_circuits(CircuitRegistry::new(
            CircuitBreakerConfig {
                failure_threshold: 2,
                cooldown: None,
            },
        ));
        let options = BatchOptions {
            concurrency: 1,
            ..fast()
        };

        let stats = controller.run(&urls, &options).await;

        assert_eq!(mock.call_count(), 2);
        assert_eq!(stats.error_breakdown.get("fetch"), Some(&2));
        assert_eq!(stats.error_breakdown.get("circuit_open"), Some(&3));
        assert!(controller.circuits().is_blocked("down.test"));
    }

    #[tokio::test]
    async fn extraction_failures_do_not_trip_circuit() {
        let mock = MockFetcher::new("<html>no recipe here</html>");
        let controller = BatchController::new(
            PacedFetcher::new(mock.clone(), ThrottleConfig::new(Duration::ZERO)),
            ExtractionChain::new(vec![
                MockStrategy::no_match("json_ld", ExtractionMethod::Structured).arc(),
            ]),
            MemoryQaSink::new(),
        )
        .with_circuits(CircuitRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: None,
        }));

        let stats = controller.run(&urls(3, "a.test"), &fast()).await;

        assert_eq!(stats.error_breakdown.get("extraction_exhausted"), Some(&3));
        assert_eq!(mock.call_count(), 3);
        assert!(!controller.circuits().is_blocked("a.test"));
    }

    #[tokio::test]
    async fn qa_write_is_retried_once() {
        let mock = MockFetcher::empty();
        let qa = FailingQaSink::new(1);
        let controller = BatchController::new(
            PacedFetcher::new(mock, ThrottleConfig::new(Duration::ZERO)),
            ExtractionChain::new(strategies()),
            qa.clone(),
        );

        let stats = controller
            .run(&["https://a.test/recipes/gone".to_string()], &fast())
            .await;

        assert_eq!(stats.failed, 1);
        assert_eq!(qa.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(qa.entries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persistent_qa_failure_does_not_abort_run() {
        let qa = FailingQaSink::new(10);
        let controller = BatchController::new(
            PacedFetcher::new(MockFetcher::empty(), ThrottleConfig::new(Duration::ZERO)),
            ExtractionChain::new(strategies()),
            qa.clone(),
        );

        let stats = controller.run(&urls(2, "a.test"), &fast()).await;

        assert_eq!(stats.failed, 2);
        // Two writes per entry, then one more after the batch.
        assert_eq!(qa.attempts.load(Ordering::SeqCst), 6);
        assert!(qa.entries.lock().unwrap().is_empty());
        let mut undelivered: Vec<_> = stats.undelivered_qa.iter().map(|e| e.url.clone()).collect();
        undelivered.sort();
        assert_eq!(undelivered, urls(2, "a.test"));
        assert_eq!(stats.report().undelivered_qa.len(), 2);
    }

    #[tokio::test]
    async fn refused_qa_entries_are_delivered_after_the_batch() {
        let qa = FailingQaSink::new(2);
        let controller = BatchController::new(
            PacedFetcher::new(MockFetcher::empty(), ThrottleConfig::new(Duration::ZERO)),
            ExtractionChain::new(strategies()),
            qa.clone(),
        );

        let stats = controller
            .run(&["https://a.test/recipes/gone".to_string()], &fast())
            .await;

        assert_eq!(qa.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(qa.entries.lock().unwrap().len(), 1);
        assert!(stats.undelivered_qa.is_empty());
    }

    #[tokio::test]
    async fn task_timeout_fails_slow_tasks() {
        let mock = MockFetcher::new("<html></html>").with_latency(Duration::from_millis(200));
        let controller = controller(&mock, Duration::ZERO);
        let options = BatchOptions {
            task_timeout: Some(Duration::from_millis(20)),
            ..fast()
        };

        let stats = controller.run(&urls(2, "a.test"), &options).await;
        assert_eq!(stats.failed, 2);
        assert!(stats.errors.iter().all(|e| e.kind == "fetch"));
    }

    #[tokio::test]
    async fn empty_run_has_zero_success_rate() {
        let controller = controller(&MockFetcher::new("<html></html>"), Duration::ZERO);
        let stats = controller.run(&[], &fast()).await;
        assert_eq!(stats.total_processed, 0);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test]
    async fn duplicate_urls_are_each_counted() {
        let mock = MockFetcher::new("<html></html>");
        let controller = controller(&mock, Duration::ZERO);
        let url = "https://a.test/recipes/dup".to_string();
        let options = BatchOptions {
            concurrency: 1,
            batch_size: 1,
            ..fast()
        };

        let stats = controller.run(&[url.clone(), url], &options).await;

        assert_eq!(stats.total_processed, 2);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn inter_task_delay_holds_the_slot() {
        let controller = controller(&MockFetcher::new("<html></html>"), Duration::ZERO);
        let options = BatchOptions {
            concurrency: 1,
            inter_task_delay: Duration::from_millis(50),
            ..fast()
        };

        let started = Instant::now();
        controller.run(&urls(3, "a.test"), &options).await;
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn every_task_holds_its_slot_for_the_delay() {
        let mock = MockFetcher::new("<html></html>");
        let controller = controller(&mock, Duration::ZERO);
        let options = BatchOptions {
            concurrency: 1,
            inter_task_delay: Duration::from_millis(50),
            ..fast()
        };
        for _ in 0..controller.circuits().threshold() {
            controller.circuits().record_failure("down.test", "HTTP 503");
        }
        controller.extract_one("https://a.test/recipes/cached").await.unwrap();
        let mut work = urls(3, "down.test");
        work.push("https://a.test/recipes/cached".to_string());
        work.push("https://a.test/recipes/cached".to_string());

        let started = Instant::now();
        let stats = controller.run(&work, &options).await;

        assert_eq!(stats.error_breakdown.get("circuit_open"), Some(&3));
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(mock.call_count(), 1);
        assert!(
            started.elapsed() >= Duration::from_millis(250),
            "five tasks finished in {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn task_timeouts_trip_the_circuit() {
        let mock = MockFetcher::new("<html></html>").with_latency(Duration::from_millis(200));
        let controller = controller(&mock, Duration::ZERO).with_circuits(CircuitRegistry::new(
            CircuitBreakerConfig {
                failure_threshold: 2,
                cooldown: None,
            },
        ));
        let options = BatchOptions {
            concurrency: 1,
            task_timeout: Some(Duration::from_millis(20)),
            ..fast()
        };

        let stats = controller.run(&urls(5, "a.test"), &options).await;

        assert_eq!(mock.call_count(), 2);
        assert_eq!(stats.error_breakdown.get("fetch"), Some(&2));
        assert_eq!(stats.error_breakdown.get("circuit_open"), Some(&3));
        assert!(controller.circuits().is_blocked("a.test"));
    }

    #[tokio::test]
    async fn timed_out_half_open_request_frees_the_slot() {
        let mock = MockFetcher::new("<html></html>").with_latency(Duration::from_millis(200));
        let circuits = CircuitRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Some(Duration::from_millis(30)),
        });
        circuits.record_failure("a.test", "HTTP 503");
        let controller = controller(&mock, Duration::ZERO).with_circuits(circuits.clone());
        let options = BatchOptions {
            concurrency: 1,
            task_timeout: Some(Duration::from_millis(20)),
            ..fast()
        };
        tokio::time::sleep(Duration::from_millis(40)).await;

        let stats = controller
            .run(&["https://a.test/recipes/trial".to_string()], &options)
            .await;
        assert_eq!(stats.error_breakdown.get("fetch"), Some(&1));
        assert_eq!(mock.call_count(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(
            circuits.try_acquire("a.test").is_some(),
            "another request is admitted after the cooldown"
        );
    }
}
