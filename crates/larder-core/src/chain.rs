//! Ordered extraction strategy chain.
//!
//! Strategies run in the order they were registered (most trusted first).
//! The first candidate that passes validation wins and nothing after it
//! runs. If every strategy comes up empty, an optional headless render of the
//! page is taken and the chain is re-run against the rendered DOM.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, StrategyAttempt};
use crate::models::{
    Candidate, ExtractionMethod, ExtractionResult, FetchedVia, RawPage, RecipeFields, compute_hash,
};
use crate::traits::{NoRenderer, Renderer, Strategy, StrategyOutcome};
use crate::validate::{confidence, validate};

/// Which strategies re-run against the rendered DOM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderRestart {
    /// Every strategy, structured metadata included (JS may inject JSON-LD).
    #[default]
    FullChain,
    /// Only site-specific and generic heuristics.
    HeuristicsOnly,
}

impl RenderRestart {
    fn includes(&self, method: ExtractionMethod) -> bool {
        match self {
            RenderRestart::FullChain => true,
            RenderRestart::HeuristicsOnly => {
                matches!(
                    method,
                    ExtractionMethod::SiteSpecific | ExtractionMethod::Generic
                )
            }
        }
    }
}

struct Accepted<'a> {
    strategy: &'a dyn Strategy,
    fields: RecipeFields,
}

/// Ordered strategies plus an optional render fallback.
pub struct ExtractionChain<R = NoRenderer> {
    strategies: Vec<Arc<dyn Strategy>>,
    renderer: Option<R>,
    render_restart: RenderRestart,
    render_timeout: Duration,
}

impl<R: Clone> Clone for ExtractionChain<R> {
    fn clone(&self) -> Self {
        Self {
            strategies: self.strategies.clone(),
            renderer: self.renderer.clone(),
            render_restart: self.render_restart,
            render_timeout: self.render_timeout,
        }
    }
}

impl ExtractionChain<NoRenderer> {
    /// A chain without a render fallback.
    pub fn new(strategies: Vec<Arc<dyn Strategy>>) -> Self {
        Self {
            strategies,
            renderer: None,
            render_restart: RenderRestart::default(),
            render_timeout: Duration::from_secs(20),
        }
    }
}

impl<R: Renderer> ExtractionChain<R> {
    /// Enable the headless-render fallback.
    pub fn with_renderer<R2: Renderer>(self, renderer: R2) -> ExtractionChain<R2> {
        ExtractionChain {
            strategies: self.strategies,
            renderer: Some(renderer),
            render_restart: self.render_restart,
            render_timeout: self.render_timeout,
        }
    }

    pub fn with_render_restart(mut self, restart: RenderRestart) -> Self {
        self.render_restart = restart;
        self
    }

    /// Wall-clock bound on a single render.
    pub fn with_render_timeout(mut self, timeout: Duration) -> Self {
        self.render_timeout = timeout;
        self
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn has_renderer(&self) -> bool {
        self.renderer.is_some()
    }

    /// Run the chain against fetched content.
    pub async fn extract(&self, page: &RawPage) -> Result<ExtractionResult, AppError> {
        let started = Instant::now();
        let mut attempts = Vec::new();
        let mut partial = None;

        if let Some(accepted) =
            self.run_strategies(page, |_| true, "", &mut attempts, &mut partial)
        {
            let method = accepted.strategy.method();
            return Ok(build_result(page, method, None, accepted.fields, started));
        }

        if let (Some(renderer), FetchedVia::Http) = (&self.renderer, page.fetched_via) {
            match self.render(renderer, &page.url).await {
                Ok(html) => {
                    let rendered = RawPage::rendered(page.url.clone(), html);
                    let restart = self.render_restart;
                    if let Some(accepted) = self.run_strategies(
                        &rendered,
                        |m| restart.includes(m),
                        "rendered:",
                        &mut attempts,
                        &mut partial,
                    ) {
                        let via = accepted.strategy.name().to_string();
                        return Ok(build_result(
                            &rendered,
                            ExtractionMethod::Rendered,
                            Some(via),
                            accepted.fields,
                            started,
                        ));
                    }
                }
                Err(e) => {
                    tracing::debug!(url = %page.url, error = %e, "Render fallback failed");
                    attempts.push(StrategyAttempt {
                        strategy: "render".to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::debug!(
            url = %page.url,
            attempts = attempts.len(),
            "Extraction exhausted"
        );
        Err(AppError::ExtractionExhausted {
            url: page.url.clone(),
            attempts,
            partial: partial.map(Box::new),
        })
    }

    async fn render(&self, renderer: &R, url: &str) -> Result<String, AppError> {
        tracing::info!(%url, "Falling back to headless render");
        match tokio::time::timeout(self.render_timeout, renderer.render(url)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(self.render_timeout.as_millis() as u64)),
        }
    }

    fn run_strategies(
        &self,
        page: &RawPage,
        include: impl Fn(ExtractionMethod) -> bool,
        label_prefix: &str,
        attempts: &mut Vec<StrategyAttempt>,
        partial: &mut Option<Candidate>,
    ) -> Option<Accepted<'_>> {
        for strategy in self.strategies.iter().filter(|s| include(s.method())) {
            let reason = match strategy.apply(page) {
                Ok(StrategyOutcome::Candidate(candidate)) => {
                    match validate(candidate.clone()) {
                        Ok(fields) => {
                            tracing::debug!(
                                url = %page.url,
                                strategy = strategy.name(),
                                "Candidate accepted"
                            );
                            return Some(Accepted {
                                strategy: strategy.as_ref(),
                                fields,
                            });
                        }
                        Err(failure) => {
                            tracing::debug!(
                                url = %page.url,
                                strategy = strategy.name(),
                                %failure,
                                "Candidate rejected"
                            );
                            partial.get_or_insert(candidate);
                            failure.to_string()
                        }
                    }
                }
                Ok(StrategyOutcome::NoMatch(reason)) => reason,
                Err(e) => {
                    tracing::debug!(
                        url = %page.url,
                        strategy = strategy.name(),
                        error = %e,
                        "Strategy failed"
                    );
                    e.to_string()
                }
            };
            attempts.push(StrategyAttempt {
                strategy: format!("{label_prefix}{}", strategy.name()),
                reason,
            });
        }
        None
    }
}

fn build_result(
    page: &RawPage,
    method: ExtractionMethod,
    rendered_via: Option<String>,
    fields: RecipeFields,
    started: Instant,
) -> ExtractionResult {
    ExtractionResult {
        url: page.url.clone(),
        method,
        cached_method: None,
        rendered_via,
        confidence: confidence(method, &fields),
        fields,
        processing_time_ms: started.elapsed().as_millis() as u64,
        content_hash: compute_hash(&page.html),
        extracted_at: Utc::now(),
    }
}
