//! Error types for the relay engine.

use std::time::Duration;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("AI service error: {0}")]
    Ai(#[from] AiError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
///
/// These are the only errors allowed to abort a session, and they must
/// surface before the watch loop starts — never mid-run.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("No active channel mappings configured")]
    NoActiveMappings,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dedup ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Failed to open ledger database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),
}

/// Transport errors.
///
/// Rate limiting is a distinct variant so the send path can honor the
/// requested backoff instead of treating it as a generic failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API call {method} failed: {description}")]
    Api { method: String, description: String },

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Media download failed: {0}")]
    MediaDownload(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the caller should back off and retry.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// AI service errors. Always recovered by the rewrite adapter — an AI
/// failure must never block forwarding.
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Service returned status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Service returned an empty completion")]
    EmptyCompletion,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Pipeline-level errors — failures of the pipeline's own collaborators,
/// not per-message outcomes (filter drops and duplicates are outcomes).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
