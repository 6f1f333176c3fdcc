use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("configuration invalid: {0}")]
    Validation(String),

    #[error("camera {camera:?} is missing the required channel field")]
    MissingChannel { camera: String },

    #[error(transparent)]
    Model(#[from] guardian_model::ModelError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
