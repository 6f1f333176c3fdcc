use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] guardian_config::ConfigError),

    #[error("channel {channel}: failed to spawn decoder: {message}")]
    SourceStart { channel: String, message: String },

    #[error("channel {channel}: circuit breaker is open")]
    CircuitOpen { channel: String },

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("supervisor is not running (state: {0})")]
    NotRunning(String),

    #[error("shutdown already completed")]
    AlreadyStopped,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
