use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::qa::QaEntry;

/// How an [`ExtractionResult`] was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// JSON-LD structured metadata.
    Structured,
    /// Embedded schema.org microdata.
    Microdata,
    /// Selector rules keyed by domain.
    SiteSpecific,
    /// Heuristic selectors.
    Generic,
    /// Any strategy run against a headless-rendered DOM.
    Rendered,
    /// Served from the result cache.
    Cache,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::Structured => "structured",
            ExtractionMethod::Microdata => "microdata",
            ExtractionMethod::SiteSpecific => "site_specific",
            ExtractionMethod::Generic => "generic",
            ExtractionMethod::Rendered => "rendered",
            ExtractionMethod::Cache => "cache",
        }
    }
}

impl std::fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Preparation, cooking and total time in minutes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeTimes {
    pub prep_minutes: Option<u32>,
    pub cook_minutes: Option<u32>,
    pub total_minutes: Option<u32>,
}

impl RecipeTimes {
    pub fn is_empty(&self) -> bool {
        self.prep_minutes.is_none() && self.cook_minutes.is_none() && self.total_minutes.is_none()
    }
}

/// The recipe record handed to downstream consumers.
///
/// Only reachable through [`crate::validate::validate`], so a value of this
/// type always has a title, at least two ingredients and one instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RecipeFields {
    pub title: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub servings: Option<String>,
    pub times: RecipeTimes,
    pub ingredients: Vec<String>,
    pub instructions: Vec<String>,
    pub author: Option<String>,
    pub cuisine: Option<String>,
    pub category: Option<String>,
}

/// What a strategy found on a page before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Candidate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub servings: Option<String>,
    pub times: RecipeTimes,
    pub ingredients: Vec<String>,
    pub instructions: Vec<String>,
    pub author: Option<String>,
    pub cuisine: Option<String>,
    pub category: Option<String>,
}

/// Where the HTML of a [`RawPage`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchedVia {
    Http,
    Browser,
}

/// Fetched page content entering the extraction chain.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub url: String,
    pub html: String,
    pub fetched_via: FetchedVia,
}

impl RawPage {
    pub fn http(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
            fetched_via: FetchedVia::Http,
        }
    }

    pub fn rendered(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
            fetched_via: FetchedVia::Browser,
        }
    }
}

/// An accepted extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub url: String,
    pub method: ExtractionMethod,
    /// For cache hits, the method that originally produced the record.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cached_method: Option<ExtractionMethod>,
    /// For rendered results, the strategy that matched the rendered DOM.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rendered_via: Option<String>,
    pub confidence: u8,
    pub fields: RecipeFields,
    pub processing_time_ms: u64,
    /// SHA-256 of the HTML the record was extracted from.
    pub content_hash: String,
    pub extracted_at: DateTime<Utc>,
}

impl ExtractionResult {
    /// The copy handed out on a cache hit.
    pub fn as_cache_hit(&self) -> Self {
        let mut hit = self.clone();
        if hit.method != ExtractionMethod::Cache {
            hit.cached_method = Some(hit.method);
            hit.method = ExtractionMethod::Cache;
        }
        hit
    }
}

/// One URL in flight through the batch controller.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub url: String,
    pub attempt_count: u32,
    pub deadline: Option<Instant>,
}

impl ExtractionRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            attempt_count: 0,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A site in the crawl registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlTarget {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub sitemap_url: Option<String>,
    #[serde(default)]
    pub sub_sitemaps: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// A failed task in a batch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub url: String,
    pub error: String,
    pub kind: String,
}

/// Statistics for one batch controller run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRunStats {
    pub run_id: Uuid,
    pub total_processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub duration_ms: u64,
    pub cache_hits: usize,
    pub errors: Vec<TaskError>,
    pub error_breakdown: BTreeMap<String, usize>,
    pub successful_results: Vec<ExtractionResult>,
    /// Failures the QA sink never accepted.
    pub undelivered_qa: Vec<QaEntry>,
}

impl BatchRunStats {
    /// Summary without the extracted records.
    pub fn report(&self) -> RunReport {
        RunReport {
            run_id: self.run_id,
            total_processed: self.total_processed,
            successful: self.successful,
            failed: self.failed,
            success_rate: self.success_rate,
            duration_ms: self.duration_ms,
            cache_hits: self.cache_hits,
            error_breakdown: self.error_breakdown.clone(),
            errors: self.errors.clone(),
            undelivered_qa: self.undelivered_qa.clone(),
        }
    }
}

/// Run summary written by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub total_processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub duration_ms: u64,
    pub cache_hits: usize,
    pub error_breakdown: BTreeMap<String, usize>,
    pub errors: Vec<TaskError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub undelivered_qa: Vec<QaEntry>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid"];

/// Canonical cache key for a URL.
///
/// Lowercases scheme and host (via [`Url`]), drops the fragment, default port
/// and tracking parameters, sorts the remaining query pairs and strips a
/// trailing slash from non-root paths. Unparseable input is returned trimmed.
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw.trim()) else {
        return raw.trim().to_string();
    };

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    url.to_string()
}

/// Host used to key per-domain state, without a leading `www.`.
pub fn domain_of(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}
