//! URL discovery for crawl targets.
//!
//! Walks a target's sitemap tree (`<sitemapindex>` children, configured
//! sub-sitemaps, `Sitemap:` lines from robots.txt), keeps the `<loc>` entries
//! that look like individual recipes and, when the sitemaps yield nothing,
//! falls back to scanning the homepage for links. All requests go through a
//! [`PacedFetcher`], so discovery is as polite as extraction.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use robotstxt::DefaultMatcher;
use scraper::{Html, Selector};
use url::Url;

use crate::error::AppError;
use crate::models::{CrawlTarget, domain_of};
use crate::throttle::PacedFetcher;
use crate::traits::{FetchOptions, Fetcher};

pub const DEFAULT_RECIPE_PATTERN: &str = r"(?i)/recipes?/[^/?#]+";

static DEFAULT_INCLUDE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(DEFAULT_RECIPE_PATTERN).expect("valid regex"));
static INDEX_SEGMENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)/(category|categories|tag|tags|page|collection|collections|search|author|authors)(/|$)",
    )
    .expect("valid regex")
});
static LOC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<loc>\s*(.*?)\s*</loc>").expect("valid regex"));
static LINK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));

/// Upper bound on sitemap documents fetched per target.
const MAX_SITEMAPS: usize = 50;

pub const DEFAULT_USER_AGENT: &str = "larder";

/// Decides whether a URL points at a single recipe.
#[derive(Debug, Clone)]
pub struct RecipeUrlPattern {
    include: Regex,
    exclude: Regex,
}

impl RecipeUrlPattern {
    /// Compile a custom include pattern, matched against the URL path.
    pub fn new(pattern: &str) -> Result<Self, AppError> {
        let include = Regex::new(pattern)
            .map_err(|e| AppError::Config(format!("invalid recipe URL pattern: {e}")))?;
        Ok(Self {
            include,
            exclude: INDEX_SEGMENTS.clone(),
        })
    }

    pub fn as_str(&self) -> &str {
        self.include.as_str()
    }

    pub fn is_match(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let path = parsed.path();
        self.include.is_match(path) && !self.exclude.is_match(path)
    }
}

impl Default for RecipeUrlPattern {
    fn default() -> Self {
        Self {
            include: DEFAULT_INCLUDE.clone(),
            exclude: INDEX_SEGMENTS.clone(),
        }
    }
}

/// Discovers recipe URLs for crawl targets.
#[derive(Clone)]
pub struct CrawlOrchestrator<F> {
    fetcher: PacedFetcher<F>,
    pattern: RecipeUrlPattern,
    options: FetchOptions,
    respect_robots: bool,
    user_agent: String,
    /// robots.txt body per domain; `None` when unavailable (everything allowed).
    robots: Arc<Mutex<HashMap<String, Option<String>>>>,
}

impl<F: Fetcher> CrawlOrchestrator<F> {
    pub fn new(fetcher: PacedFetcher<F>) -> Self {
        Self {
            fetcher,
            pattern: RecipeUrlPattern::default(),
            options: FetchOptions {
                max_retries: 2,
                timeout: Duration::from_secs(10),
                backoff: Duration::from_millis(500),
                headers: Vec::new(),
            },
            respect_robots: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            robots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_pattern(mut self, pattern: RecipeUrlPattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_fetch_options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_respect_robots(mut self, respect: bool) -> Self {
        self.respect_robots = respect;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Discover up to `limit` recipe URLs for one target.
    pub async fn discover_urls(
        &self,
        target: &CrawlTarget,
        limit: usize,
    ) -> Result<Vec<String>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let base = Url::parse(&target.base_url)
            .map_err(|e| AppError::Config(format!("invalid base_url for {}: {e}", target.name)))?;

        let robots = self.robots_for(&base).await;

        let mut roots: Vec<String> = target
            .sitemap_url
            .iter()
            .chain(target.sub_sitemaps.iter())
            .cloned()
            .collect();
        if roots.is_empty() {
            roots = robots.as_deref().map(sitemaps_in_robots).unwrap_or_default();
        }
        if roots.is_empty()
            && let Ok(default) = base.join("/sitemap.xml")
        {
            roots.push(default.to_string());
        }

        let mut found = self.walk_sitemaps(roots, robots.as_deref(), limit).await;

        if found.is_empty() {
            tracing::info!(site = %target.name, "Sitemaps yielded nothing, walking homepage");
            let html = self.fetcher.fetch_text(base.as_str(), &self.options).await?;
            found = self.filter_candidates(self.homepage_links(&base, &html), robots.as_deref());
        }

        found.truncate(limit);
        tracing::info!(site = %target.name, count = found.len(), "Discovered recipe URLs");
        Ok(found)
    }

    /// Discover URLs for every active target, highest priority first.
    ///
    /// A failing target is logged and skipped.
    pub async fn discover_all(&self, targets: &[CrawlTarget], limit_per_target: usize) -> Vec<String> {
        let mut ordered: Vec<&CrawlTarget> = targets.iter().filter(|t| t.active).collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut urls = Vec::new();
        for target in ordered {
            match self.discover_urls(target, limit_per_target).await {
                Ok(found) => urls.extend(found),
                Err(e) => {
                    tracing::warn!(site = %target.name, error = %e, "Discovery failed, skipping target");
                }
            }
        }
        urls
    }

    async fn walk_sitemaps(
        &self,
        roots: Vec<String>,
        robots: Option<&str>,
        limit: usize,
    ) -> Vec<String> {
        let mut queue: VecDeque<String> = roots.into();
        let mut visited = HashSet::new();
        let mut found = Vec::new();
        let mut seen = HashSet::new();

        while let Some(sitemap) = queue.pop_front() {
            if found.len() >= limit || visited.len() >= MAX_SITEMAPS {
                break;
            }
            if !visited.insert(sitemap.clone()) {
                continue;
            }

            let body = match self.fetcher.fetch_text(&sitemap, &self.options).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(%sitemap, error = %e, "Sitemap fetch failed");
                    continue;
                }
            };

            let locs = self.locs(&body);
            if body.contains("<sitemapindex") {
                tracing::debug!(%sitemap, children = locs.len(), "Following sitemap index");
                queue.extend(locs);
                continue;
            }

            for url in self.filter_candidates(locs, robots) {
                if seen.insert(url.clone()) {
                    found.push(url);
                }
            }
        }
        found
    }

    fn locs(&self, xml: &str) -> Vec<String> {
        LOC_RE
            .captures_iter(xml)
            .filter_map(|c| c.get(1))
            .map(|m| unescape_xml(m.as_str()))
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Same-host anchors from parsed HTML; scripts and comments are ignored.
    fn homepage_links(&self, base: &Url, html: &str) -> Vec<String> {
        let host = domain_of(base.as_str());
        let document = Html::parse_document(html);
        document
            .select(&LINK_SELECTOR)
            .filter_map(|a| a.value().attr("href"))
            .map(str::trim)
            .filter(|href| !href.is_empty() && !href.starts_with('#'))
            .filter_map(|href| base.join(href).ok())
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .map(|mut u| {
                u.set_fragment(None);
                u.to_string()
            })
            .filter(|u| domain_of(u) == host)
            .collect()
    }

    /// Pattern filter, robots filter and order-preserving de-duplication.
    fn filter_candidates(&self, urls: Vec<String>, robots: Option<&str>) -> Vec<String> {
        let mut seen = HashSet::new();
        urls.into_iter()
            .filter(|u| self.pattern.is_match(u))
            .filter(|u| self.allowed(robots, u))
            .filter(|u| seen.insert(u.clone()))
            .collect()
    }

    fn allowed(&self, robots: Option<&str>, url: &str) -> bool {
        if !self.respect_robots {
            return true;
        }
        let Some(body) = robots else {
            return true;
        };
        let mut matcher = DefaultMatcher::default();
        let allowed = matcher.one_agent_allowed_by_robots(body, &self.user_agent, url);
        if !allowed {
            tracing::debug!(%url, "Disallowed by robots.txt");
        }
        allowed
    }

    async fn robots_for(&self, base: &Url) -> Option<String> {
        let domain = domain_of(base.as_str())?;
        if let Some(cached) = self
            .robots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&domain)
        {
            return cached.clone();
        }

        let body = match base.join("/robots.txt") {
            Ok(robots_url) => match self.fetcher.fetch_text(robots_url.as_str(), &self.options).await {
                Ok(body) => Some(body),
                Err(e) => {
                    tracing::debug!(%domain, error = %e, "No robots.txt");
                    None
                }
            },
            Err(_) => None,
        };

        self.robots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(domain, body.clone());
        body
    }
}

/// `Sitemap:` directives in a robots.txt body.
pub fn sitemaps_in_robots(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case("sitemap")
                .then(|| value.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn unescape_xml(raw: &str) -> String {
    let trimmed = raw
        .trim()
        .trim_start_matches("<![CDATA[")
        .trim_end_matches("]]>")
        .trim();
    trimmed
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockFetcher;
    use crate::throttle::ThrottleConfig;

    fn orchestrator(mock: &MockFetcher) -> CrawlOrchestrator<MockFetcher> {
        CrawlOrchestrator::new(PacedFetcher::new(
            mock.clone(),
            ThrottleConfig::new(Duration::ZERO),
        ))
    }

    fn target(name: &str, sitemap: Option<&str>) -> CrawlTarget {
        CrawlTarget {
            name: name.into(),
            base_url: format!("https://{name}.test"),
            sitemap_url: sitemap.map(String::from),
            sub_sitemaps: vec![],
            category: None,
            priority: 0,
            active: true,
        }
    }

    fn urlset(locs: &[&str]) -> String {
        let body: String = locs
            .iter()
            .map(|l| format!("<url><loc>{l}</loc></url>"))
            .collect();
        format!(r#"<?xml version="1.0"?><urlset>{body}</urlset>"#)
    }

    #[test]
    fn pattern_accepts_recipes_and_rejects_indexes() {
        let pattern = RecipeUrlPattern::default();
        assert!(pattern.is_match("https://a.test/recipes/lemon-tart"));
        assert!(pattern.is_match("https://a.test/recipe/lemon-tart/"));
        assert!(pattern.is_match("https://a.test/en/Recipes/123-soup?ref=x"));
        assert!(!pattern.is_match("https://a.test/recipes/"));
        assert!(!pattern.is_match("https://a.test/recipes/category/dinner"));
        assert!(!pattern.is_match("https://a.test/recipes/page/2"));
        assert!(!pattern.is_match("https://a.test/tag/recipes/vegan"));
        assert!(!pattern.is_match("https://a.test/about"));
        assert!(!pattern.is_match("not a url"));
    }

    #[test]
    fn invalid_custom_pattern_is_a_config_error() {
        assert!(matches!(
            RecipeUrlPattern::new("(unclosed"),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn reads_sitemap_lines_from_robots() {
        let body = "User-agent: *\nDisallow: /admin\nSitemap: https://a.test/s1.xml\nsitemap:https://a.test/s2.xml\n";
        assert_eq!(
            sitemaps_in_robots(body),
            vec!["https://a.test/s1.xml", "https://a.test/s2.xml"]
        );
    }

    #[tokio::test]
    async fn filters_dedupes_and_truncates_sitemap_locs() {
        let mock = MockFetcher::empty().with_page(
            "https://a.test/sitemap.xml",
            &urlset(&[
                "https://a.test/recipes/one",
                "https://a.test/recipes/",
                "https://a.test/about",
                "https://a.test/recipes/one",
                "https://a.test/recipes/two",
                "https://a.test/recipes/three",
            ]),
        );
        let orch = orchestrator(&mock);
        let t = target("a", Some("https://a.test/sitemap.xml"));

        let urls = orch.discover_urls(&t, 10).await.unwrap();
        assert_eq!(
            urls,
            vec![
                "https://a.test/recipes/one",
                "https://a.test/recipes/two",
                "https://a.test/recipes/three"
            ]
        );

        let urls = orch.discover_urls(&t, 2).await.unwrap();
        assert_eq!(urls.len(), 2);
    }

    #[tokio::test]
    async fn follows_sitemap_index_children() {
        let index = r#"<sitemapindex>
            <sitemap><loc>https://a.test/post-sitemap.xml</loc></sitemap>
            <sitemap><loc>https://a.test/recipe-sitemap.xml</loc></sitemap>
        </sitemapindex>"#;
        let mock = MockFetcher::empty()
            .with_page("https://a.test/sitemap_index.xml", index)
            .with_page("https://a.test/post-sitemap.xml", &urlset(&["https://a.test/blog/hello"]))
            .with_page(
                "https://a.test/recipe-sitemap.xml",
                &urlset(&["https://a.test/recipes/soup", "https://a.test/recipes/stew"]),
            );
        let orch = orchestrator(&mock);

        let urls = orch
            .discover_urls(&target("a", Some("https://a.test/sitemap_index.xml")), 10)
            .await
            .unwrap();
        assert_eq!(urls, vec!["https://a.test/recipes/soup", "https://a.test/recipes/stew"]);
    }

    #[tokio::test]
    async fn uses_robots_sitemaps_and_honours_disallow() {
        let robots = "User-agent: *\nDisallow: /recipes/secret\nSitemap: https://a.test/from-robots.xml\n";
        let mock = MockFetcher::empty()
            .with_page("https://a.test/robots.txt", robots)
            .with_page(
                "https://a.test/from-robots.xml",
                &urlset(&["https://a.test/recipes/open", "https://a.test/recipes/secret-sauce"]),
            );

        let urls = orchestrator(&mock)
            .discover_urls(&target("a", None), 10)
            .await
            .unwrap();
        assert_eq!(urls, vec!["https://a.test/recipes/open"]);

        let urls = orchestrator(&mock)
            .with_respect_robots(false)
            .discover_urls(&target("a", None), 10)
            .await
            .unwrap();
        assert_eq!(urls.len(), 2);
    }

    #[tokio::test]
    async fn falls_back_to_homepage_links() {
        let home = r##"<html><body>
            <a href="/recipes/pancakes">Pancakes</a>
            <a href="https://a.test/recipes/waffles#comments">Waffles</a>
            <a href="https://elsewhere.test/recipes/crepes">Crepes</a>
            <a href="/recipes/category/breakfast">Breakfast</a>
            <a href="#top">Top</a>
        </body></html>"##;
        let mock = MockFetcher::empty()
            .with_status("https://a.test/sitemap.xml", 500)
            .with_page("https://a.test/", home);

        let urls = orchestrator(&mock)
            .discover_urls(&target("a", Some("https://a.test/sitemap.xml")), 10)
            .await
            .unwrap();
        assert_eq!(
            urls,
            vec!["https://a.test/recipes/pancakes", "https://a.test/recipes/waffles"]
        );
    }

    #[tokio::test]
    async fn homepage_links_come_from_anchors_only() {
        let home = r##"<html><head>
            <script>var next = '<a href="/recipes/from-script">x</a>';</script>
        </head><body>
            <!-- <a href="/recipes/commented-out">old</a> -->
            <a href=/recipes/unquoted>Unquoted</a>
            <a href="/recipes/mac&amp;cheese">Mac</a>
            <link href="/recipes/feed-link" rel="alternate">
        </body></html>"##;
        let mock = MockFetcher::empty().with_page("https://a.test/", home);

        let urls = orchestrator(&mock)
            .with_respect_robots(false)
            .discover_urls(&target("a", None), 10)
            .await
            .unwrap();
        assert_eq!(
            urls,
            vec!["https://a.test/recipes/unquoted", "https://a.test/recipes/mac&cheese"]
        );
    }

    #[tokio::test]
    async fn homepage_failure_is_surfaced() {
        let mock = MockFetcher::empty().with_status("https://a.test/", 503);
        let result = orchestrator(&mock)
            .discover_urls(&target("a", Some("https://a.test/sitemap.xml")), 10)
            .await;
        assert!(matches!(result, Err(AppError::Status { status: 503, .. })));
    }

    #[tokio::test]
    async fn discover_all_orders_by_priority_and_skips_inactive() {
        let mock = MockFetcher::empty()
            .with_page("https://low.test/sitemap.xml", &urlset(&["https://low.test/recipes/l"]))
            .with_page("https://high.test/sitemap.xml", &urlset(&["https://high.test/recipes/h"]))
            .with_page("https://off.test/sitemap.xml", &urlset(&["https://off.test/recipes/o"]))
            .with_status("https://broken.test/", 500);

        let mut low = target("low", Some("https://low.test/sitemap.xml"));
        low.priority = 1;
        let mut high = target("high", Some("https://high.test/sitemap.xml"));
        high.priority = 10;
        let mut off = target("off", Some("https://off.test/sitemap.xml"));
        off.active = false;
        off.priority = 100;
        let broken = target("broken", Some("https://broken.test/sitemap.xml"));

        let urls = orchestrator(&mock)
            .discover_all(&[low, broken, off, high], 5)
            .await;
        assert_eq!(
            urls,
            vec!["https://high.test/recipes/h", "https://low.test/recipes/l"]
        );
        assert_eq!(mock.calls_for("https://off.test/sitemap.xml"), 0);
    }
}
