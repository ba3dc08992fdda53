use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed pipeline, stage, or manifest settings. Raised before any
    /// work starts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A referenced source, table, or artifact is missing.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Client error: {0}")]
    Client(#[from] gridpipe_client::ClientError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Stage '{name}' failed: {source}")]
    Stage {
        name: String,
        #[source]
        source: Box<PipelineError>,
    },

    /// A submitted operation reached a failed terminal state and the stage
    /// escalated it.
    #[error("Operation '{operation}' failed: {diagnostic}")]
    OperationFailed {
        operation: String,
        diagnostic: String,
    },
}
