//! Pipeline configuration.
//!
//! Loaded from an optional JSON file; every field has a default so a partial
//! file (or none at all) is valid. The CLI layers flag/env overrides on top
//! and calls [`PipelineConfig::validate`] before scheduling any work.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::BatchOptions;
use crate::cache::CacheConfig;
use crate::chain::RenderRestart;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::crawl::{DEFAULT_RECIPE_PATTERN, RecipeUrlPattern};
use crate::error::AppError;
use crate::models::CrawlTarget;
use crate::throttle::ThrottleConfig;
use crate::traits::FetchOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub concurrency: usize,
    pub batch_size: usize,
    pub inter_task_delay_ms: u64,
    pub task_timeout_ms: Option<u64>,
    pub fetch_timeout_ms: u64,
    pub fetch_max_retries: u32,
    pub fetch_backoff_ms: u64,
    pub render_timeout_ms: u64,
    pub cache_ttl_ms: u64,
    pub cache_max_entries: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_ms: Option<u64>,
    pub domain_delay_ms: u64,
    pub domain_jitter_ms: u64,
    pub recipe_url_pattern: String,
    pub respect_robots: bool,
    pub render_restart: RenderRestart,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            batch_size: 50,
            inter_task_delay_ms: 250,
            task_timeout_ms: None,
            fetch_timeout_ms: 10_000,
            fetch_max_retries: 3,
            fetch_backoff_ms: 1_000,
            render_timeout_ms: 20_000,
            cache_ttl_ms: 86_400_000,
            cache_max_entries: 10_000,
            circuit_failure_threshold: 5,
            circuit_cooldown_ms: None,
            domain_delay_ms: 1_000,
            domain_jitter_ms: 0,
            recipe_url_pattern: DEFAULT_RECIPE_PATTERN.to_string(),
            respect_robots: true,
            render_restart: RenderRestart::FullChain,
        }
    }
}

impl PipelineConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| AppError::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.concurrency == 0 {
            return Err(AppError::Config("concurrency must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(AppError::Config("batch_size must be at least 1".into()));
        }
        if self.circuit_failure_threshold == 0 {
            return Err(AppError::Config(
                "circuit_failure_threshold must be at least 1".into(),
            ));
        }
        if self.fetch_max_retries == 0 {
            return Err(AppError::Config(
                "fetch_max_retries must be at least 1".into(),
            ));
        }
        if self.fetch_timeout_ms == 0 || self.render_timeout_ms == 0 {
            return Err(AppError::Config("timeouts must be greater than 0".into()));
        }
        RecipeUrlPattern::new(&self.recipe_url_pattern)?;
        Ok(())
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            max_retries: self.fetch_max_retries,
            timeout: Duration::from_millis(self.fetch_timeout_ms),
            backoff: Duration::from_millis(self.fetch_backoff_ms),
            headers: Vec::new(),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_millis(self.cache_ttl_ms),
            max_entries: self.cache_max_entries,
            enabled: self.cache_ttl_ms > 0,
        }
    }

    pub fn circuit_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            cooldown: self.circuit_cooldown_ms.map(Duration::from_millis),
        }
    }

    pub fn throttle_config(&self) -> ThrottleConfig {
        ThrottleConfig::new(Duration::from_millis(self.domain_delay_ms))
            .with_jitter(Duration::from_millis(self.domain_jitter_ms))
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            concurrency: self.concurrency,
            batch_size: self.batch_size,
            inter_task_delay: Duration::from_millis(self.inter_task_delay_ms),
            task_timeout: self.task_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_millis(self.render_timeout_ms)
    }

    pub fn url_pattern(&self) -> Result<RecipeUrlPattern, AppError> {
        RecipeUrlPattern::new(&self.recipe_url_pattern)
    }
}

/// Load the crawl target registry (a JSON array).
pub fn load_targets(path: impl AsRef<Path>) -> Result<Vec<CrawlTarget>, AppError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("cannot read target registry {}: {e}", path.display()))
    })?;
    let targets: Vec<CrawlTarget> = serde_json::from_str(&raw).map_err(|e| {
        AppError::Config(format!("invalid target registry {}: {e}", path.display()))
    })?;
    for target in &targets {
        if target.name.trim().is_empty() {
            return Err(AppError::Config("target with empty name".into()));
        }
        if url::Url::parse(&target.base_url).is_err() {
            return Err(AppError::Config(format!(
                "target {} has invalid base_url {}",
                target.name, target.base_url
            )));
        }
    }
    Ok(targets)
}
