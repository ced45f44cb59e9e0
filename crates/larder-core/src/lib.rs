pub mod batch;
pub mod cache;
pub mod chain;
pub mod circuit_breaker;
pub mod config;
pub mod crawl;
pub mod error;
pub mod models;
pub mod qa;
pub mod throttle;
pub mod traits;
pub mod validate;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use batch::{BatchController, BatchOptions, BatchReporter, TracingBatchReporter};
pub use cache::{CacheConfig, RecipeCache};
pub use chain::{ExtractionChain, RenderRestart};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitRegistry};
pub use config::{PipelineConfig, load_targets};
pub use crawl::{CrawlOrchestrator, RecipeUrlPattern};
pub use error::AppError;
pub use models::{
    BatchRunStats, Candidate, CrawlTarget, ExtractionMethod, ExtractionResult, RawPage,
    RecipeFields, RunReport, TaskError, compute_hash, normalize_url,
};
pub use qa::{JsonlQaSink, MemoryQaSink, QaEntry};
pub use throttle::{DomainPacer, PacedFetcher, ThrottleConfig};
pub use traits::{FetchOptions, Fetcher, NoRenderer, Renderer, Strategy, StrategyOutcome};
