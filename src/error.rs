use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the admission-control engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Validation failure on policy create/update. Carries every violated
    /// constraint; raised before any mutation takes place.
    #[error("invalid policy: {}", .0.join("; "))]
    InvalidPolicy(Vec<String>),

    #[error("not found: {0}")]
    NotFound(String),

    /// Counter backend error or timeout. Never treated as a zero count;
    /// the gate resolves it through its configured failure policy.
    #[error("counter store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for EngineError {
    fn from(e: redis::RedisError) -> Self {
        EngineError::StoreUnavailable(e.to_string())
    }
}
