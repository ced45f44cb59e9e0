mod output;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use larder_client::{ReqwestFetcher, SiteRulesStrategy, strategies_with_rules};
use larder_core::traits::{QaSink, Renderer};
use larder_core::{
    BatchController, CircuitRegistry, CrawlOrchestrator, DomainPacer, ExtractionChain,
    JsonlQaSink, MemoryQaSink, PacedFetcher, PipelineConfig, RecipeCache, RenderRestart,
    load_targets,
};

#[derive(Parser)]
#[command(name = "larder", version, about = "Resilient recipe extraction pipeline")]
struct Cli {
    /// JSON pipeline config; every field is optional
    #[arg(short, long, env = "LARDER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Extra site rules (JSON array), consulted before the built-in ones
    #[arg(long, env = "LARDER_SITE_RULES", global = true)]
    site_rules: Option<PathBuf>,

    /// Allow fetching private and loopback addresses
    #[arg(long, env = "LARDER_ALLOW_PRIVATE_URLS", global = true, default_value_t = false)]
    allow_private_urls: bool,

    /// Re-render pages in headless Chromium when static extraction fails
    #[arg(long, env = "LARDER_RENDER", global = true, default_value_t = false)]
    render: bool,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Commands,
}

/// Flag / env overrides layered over the config file.
#[derive(Args, Default)]
struct ConfigOverrides {
    /// Maximum URLs in flight
    #[arg(long, env = "LARDER_CONCURRENCY", global = true)]
    concurrency: Option<usize>,

    /// URLs per batch
    #[arg(long, env = "LARDER_BATCH_SIZE", global = true)]
    batch_size: Option<usize>,

    /// Pause after each task before its slot is reused (ms)
    #[arg(long, env = "LARDER_INTER_TASK_DELAY_MS", global = true)]
    inter_task_delay_ms: Option<u64>,

    /// Wall-clock limit per URL (ms)
    #[arg(long, env = "LARDER_TASK_TIMEOUT_MS", global = true)]
    task_timeout_ms: Option<u64>,

    /// Per-attempt fetch timeout (ms)
    #[arg(long, env = "LARDER_FETCH_TIMEOUT_MS", global = true)]
    fetch_timeout_ms: Option<u64>,

    /// Fetch attempts per URL
    #[arg(long, env = "LARDER_FETCH_MAX_RETRIES", global = true)]
    fetch_max_retries: Option<u32>,

    /// Headless render timeout (ms)
    #[arg(long, env = "LARDER_RENDER_TIMEOUT_MS", global = true)]
    render_timeout_ms: Option<u64>,

    /// Result cache TTL (ms); 0 disables the cache
    #[arg(long, env = "LARDER_CACHE_TTL_MS", global = true)]
    cache_ttl_ms: Option<u64>,

    /// Consecutive failures before a domain's circuit opens
    #[arg(long, env = "LARDER_CIRCUIT_FAILURE_THRESHOLD", global = true)]
    circuit_failure_threshold: Option<u32>,

    /// Minimum spacing between requests to one domain (ms)
    #[arg(long, env = "LARDER_DOMAIN_DELAY_MS", global = true)]
    domain_delay_ms: Option<u64>,

    /// Regex a URL path must match to count as a recipe page
    #[arg(long, env = "LARDER_RECIPE_URL_PATTERN", global = true)]
    recipe_url_pattern: Option<String>,

    /// Honour robots.txt during discovery
    #[arg(long, env = "LARDER_RESPECT_ROBOTS", global = true)]
    respect_robots: Option<bool>,

    /// Strategies re-run on a rendered page
    #[arg(long, env = "LARDER_RENDER_RESTART", global = true, value_parser = parse_render_restart)]
    render_restart: Option<RenderRestart>,
}

impl ConfigOverrides {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(v) = self.concurrency {
            config.concurrency = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.inter_task_delay_ms {
            config.inter_task_delay_ms = v;
        }
        if let Some(v) = self.task_timeout_ms {
            config.task_timeout_ms = Some(v);
        }
        if let Some(v) = self.fetch_timeout_ms {
            config.fetch_timeout_ms = v;
        }
        if let Some(v) = self.fetch_max_retries {
            config.fetch_max_retries = v;
        }
        if let Some(v) = self.render_timeout_ms {
            config.render_timeout_ms = v;
        }
        if let Some(v) = self.cache_ttl_ms {
            config.cache_ttl_ms = v;
        }
        if let Some(v) = self.circuit_failure_threshold {
            config.circuit_failure_threshold = v;
        }
        if let Some(v) = self.domain_delay_ms {
            config.domain_delay_ms = v;
        }
        if let Some(v) = self.recipe_url_pattern {
            config.recipe_url_pattern = v;
        }
        if let Some(v) = self.respect_robots {
            config.respect_robots = v;
        }
        if let Some(v) = self.render_restart {
            config.render_restart = v;
        }
    }
}

fn parse_render_restart(raw: &str) -> Result<RenderRestart, String> {
    match raw {
        "full_chain" | "full" => Ok(RenderRestart::FullChain),
        "heuristics_only" | "heuristics" => Ok(RenderRestart::HeuristicsOnly),
        other => Err(format!(
            "unknown render restart '{other}' (expected full_chain or heuristics_only)"
        )),
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Extract one recipe and print it as JSON
    Extract {
        /// Recipe page URL
        url: String,
    },

    /// List recipe URLs found in the target registry's sitemaps
    Discover {
        /// Crawl target registry (JSON array)
        #[arg(short, long, env = "LARDER_TARGETS", default_value = "targets.json")]
        targets: PathBuf,

        /// Maximum URLs per target
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },

    /// Extract a batch of URLs from a list or from discovery
    Run {
        /// File with one URL per line
        #[arg(short, long, conflicts_with = "targets")]
        urls: Option<PathBuf>,

        /// Discover URLs from this target registry instead
        #[arg(short, long)]
        targets: Option<PathBuf>,

        /// Maximum URLs per target when discovering
        #[arg(short, long, default_value_t = 100)]
        limit: usize,

        /// Write successful records as NDJSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write the run summary as JSON
        #[arg(long)]
        report: Option<PathBuf>,

        /// Write failed URLs as CSV
        #[arg(long)]
        errors_csv: Option<PathBuf>,

        /// Append-only failure log for manual review
        #[arg(long, env = "LARDER_QA_PATH", default_value = "qa/failures.jsonl")]
        qa: PathBuf,
    },

    /// Show the crawl target registry
    Targets {
        #[arg(short, long, env = "LARDER_TARGETS", default_value = "targets.json")]
        targets: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("larder=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    cli.overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let site_rules = match &cli.site_rules {
        Some(path) => SiteRulesStrategy::load(path)
            .with_context(|| format!("Failed to load site rules: {}", path.display()))?,
        None => SiteRulesStrategy::builtin().context("Built-in site rules are invalid")?,
    };
    let chain = ExtractionChain::new(strategies_with_rules(site_rules))
        .with_render_restart(config.render_restart)
        .with_render_timeout(config.render_timeout());

    let mut fetcher = ReqwestFetcher::new().context("Failed to create HTTP client")?;
    if cli.allow_private_urls {
        fetcher = fetcher.allow_private_urls();
    }
    let pipeline = Pipeline { config, fetcher };

    if cli.render {
        #[cfg(feature = "browser")]
        {
            let renderer =
                larder_client::BrowserRenderer::with_timeout(pipeline.config.render_timeout())
                    .await
                    .context("Failed to launch headless browser")?;
            return pipeline.dispatch(cli.command, chain.with_renderer(renderer)).await;
        }
        #[cfg(not(feature = "browser"))]
        anyhow::bail!("--render needs a build with the `browser` feature");
    }

    pipeline.dispatch(cli.command, chain).await
}

struct Pipeline {
    config: PipelineConfig,
    fetcher: ReqwestFetcher,
}

impl Pipeline {
    async fn dispatch<R: Renderer>(
        self,
        command: Commands,
        chain: ExtractionChain<R>,
    ) -> Result<()> {
        match command {
            Commands::Extract { url } => self.cmd_extract(&url, chain).await,
            Commands::Discover { targets, limit } => self.cmd_discover(&targets, limit).await,
            Commands::Run {
                urls,
                targets,
                limit,
                output: ndjson,
                report,
                errors_csv,
                qa,
            } => {
                let urls = match (urls, targets) {
                    (Some(list), _) => output::read_url_list(&list)?,
                    (None, Some(registry)) => self.discover(&registry, limit).await?,
                    (None, None) => anyhow::bail!("run needs --urls <file> or --targets <file>"),
                };
                let qa = JsonlQaSink::open(&qa)
                    .await
                    .with_context(|| format!("Failed to open QA log: {}", qa.display()))?;
                self.cmd_run(
                    &urls,
                    chain,
                    qa,
                    RunOutputs {
                        ndjson,
                        report,
                        errors_csv,
                    },
                )
                .await
            }
            Commands::Targets { targets } => cmd_targets(&targets),
        }
    }

    fn pacer(&self) -> DomainPacer {
        DomainPacer::new(self.config.throttle_config())
    }

    fn controller<R: Renderer, Q: QaSink>(
        &self,
        chain: ExtractionChain<R>,
        qa: Q,
    ) -> BatchController<ReqwestFetcher, R, Q> {
        BatchController::new(
            PacedFetcher::with_pacer(self.fetcher.clone(), self.pacer()),
            chain,
            qa,
        )
        .with_cache(RecipeCache::new(self.config.cache_config()))
        .with_circuits(CircuitRegistry::new(self.config.circuit_config()))
        .with_fetch_options(self.config.fetch_options())
    }

    async fn discover(&self, targets_path: &Path, limit: usize) -> Result<Vec<String>> {
        let targets = load_targets(targets_path)
            .with_context(|| format!("Failed to load targets: {}", targets_path.display()))?;
        let pattern = self
            .config
            .url_pattern()
            .context("Invalid recipe URL pattern")?;

        let crawler = CrawlOrchestrator::new(PacedFetcher::with_pacer(
            self.fetcher.clone(),
            self.pacer(),
        ))
        .with_pattern(pattern)
        .with_respect_robots(self.config.respect_robots);

        let urls = crawler.discover_all(&targets, limit).await;
        tracing::info!(
            targets = targets.len(),
            urls = urls.len(),
            "Discovery complete"
        );
        Ok(urls)
    }

    async fn cmd_extract<R: Renderer>(&self, url: &str, chain: ExtractionChain<R>) -> Result<()> {
        tracing::info!("Extracting {}", url);

        let controller = self.controller(chain, MemoryQaSink::new());
        let result = controller
            .extract_one(url)
            .await
            .with_context(|| format!("Extraction failed for {url}"))?;

        tracing::info!(
            method = %result.method.as_str(),
            confidence = result.confidence,
            content_hash = %&result.content_hash[..8],
            "Extraction complete"
        );

        println!("{}", serde_json::to_string_pretty(&result)?);
        Ok(())
    }

    async fn cmd_discover(&self, targets_path: &Path, limit: usize) -> Result<()> {
        for url in self.discover(targets_path, limit).await? {
            println!("{url}");
        }
        Ok(())
    }

    async fn cmd_run<R: Renderer, Q: QaSink>(
        &self,
        urls: &[String],
        chain: ExtractionChain<R>,
        qa: Q,
        outputs: RunOutputs,
    ) -> Result<()> {
        if urls.is_empty() {
            tracing::warn!("No URLs to process");
        }

        let controller = self.controller(chain, qa);
        let stats = controller.run(urls, &self.config.batch_options()).await;

        if let Some(path) = &outputs.ndjson {
            output::write_ndjson(path, &stats.successful_results)?;
            tracing::info!(path = %path.display(), records = stats.successful, "Wrote results");
        }
        if let Some(path) = &outputs.report {
            output::write_report(path, &stats)?;
        }
        if let Some(path) = &outputs.errors_csv {
            output::write_errors_csv(path, &stats)?;
        }

        println!("{}", serde_json::to_string_pretty(&stats.report())?);
        Ok(())
    }
}

struct RunOutputs {
    ndjson: Option<PathBuf>,
    report: Option<PathBuf>,
    errors_csv: Option<PathBuf>,
}

fn cmd_targets(path: &Path) -> Result<()> {
    let mut targets = load_targets(path)
        .with_context(|| format!("Failed to load targets: {}", path.display()))?;

    if targets.is_empty() {
        println!("No targets in {}", path.display());
        return Ok(());
    }

    targets.sort_by(|a, b| b.priority.cmp(&a.priority));
    println!("Crawl targets in {}:\n", path.display());
    for target in &targets {
        let status = if target.active { "active" } else { "inactive" };
        println!(
            "  [{}] {} (priority {}) {}{}",
            status,
            target.name,
            target.priority,
            target.base_url,
            target
                .category
                .as_deref()
                .map(|c| format!(" [{c}]"))
                .unwrap_or_default(),
        );
    }
    println!("\nTotal: {} targets", targets.len());
    Ok(())
}
