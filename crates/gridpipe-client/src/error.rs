use gridpipe_duck::EngineError;
use gridpipe_ir::TranslateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Malformed descriptor or settings. Raised before any work starts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A referenced table, file, or artifact is missing.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Connectivity or HTTP failure talking to the cluster. Not retried.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A managed query job reached a failed state.
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Translate error: {0}")]
    Translate(#[from] TranslateError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
