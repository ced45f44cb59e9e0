use serde::Serialize;
use thiserror::Error;

use crate::models::Candidate;
use crate::validate::ValidationFailure;

/// The last outcome of one strategy during an exhausted extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyAttempt {
    pub strategy: String,
    pub reason: String,
}

impl std::fmt::Display for StrategyAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.strategy, self.reason)
    }
}

/// Application-wide error types for Larder.
#[derive(Error, Debug)]
pub enum AppError {
    /// All fetch attempts for a URL failed.
    #[error("Fetch failed for {url} after {attempts} attempt(s): {cause}")]
    Fetch {
        url: String,
        attempts: u32,
        cause: Box<AppError>,
    },

    /// HTTP request failed or returned a non-success status.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Non-success HTTP status.
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// A single attempt timed out.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// The domain's circuit is open; no fetch was attempted.
    #[error("Circuit open for {domain}: {reason}")]
    CircuitOpen { domain: String, reason: String },

    /// Every strategy was tried without producing a valid candidate.
    #[error("Extraction exhausted for {url} ({})", format_attempts(.attempts))]
    ExtractionExhausted {
        url: String,
        attempts: Vec<StrategyAttempt>,
        /// The most trusted candidate that failed validation, for QA review.
        partial: Option<Box<Candidate>>,
    },

    /// A candidate was present but violates the record invariants.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationFailure),

    /// A strategy hit a genuine fault (malformed input, I/O during render).
    #[error("Strategy {strategy} failed: {message}")]
    Strategy { strategy: String, message: String },

    /// Headless render failed.
    #[error("Render error: {0}")]
    RenderError(String),

    /// Startup misconfiguration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_attempts(attempts: &[StrategyAttempt]) -> String {
    if attempts.is_empty() {
        return "no strategies attempted".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::Status { status, .. } => *status == 429 || *status >= 500 || *status == 408,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if this error should count against the domain's circuit.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::Fetch { cause, .. } => cause.should_trip_circuit() || cause.is_retryable(),
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::Status { status, .. } => *status == 403 || *status == 429 || *status >= 500,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("connection")
            }
            _ => false,
        }
    }

    /// Stable label used in QA entries and the run's error breakdown.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Fetch { .. }
            | AppError::HttpError(_)
            | AppError::Status { .. }
            | AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded => "fetch",
            AppError::CircuitOpen { .. } => "circuit_open",
            AppError::ExtractionExhausted { .. } => "extraction_exhausted",
            AppError::Validation(_) => "validation",
            AppError::Strategy { .. } => "strategy",
            AppError::RenderError(_) => "render",
            AppError::Config(_) => "config",
            AppError::SerializationError(_) => "serialization",
            AppError::Io(_) => "io",
        }
    }
}
