use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Every model in the fallback chain failed to load.
    #[error("No embedding model available (tried: {})", attempted.join(", "))]
    ModelUnavailable { attempted: Vec<String> },

    #[error("Corpus is empty")]
    EmptyCorpus,

    #[error("Cache corrupt: {0}")]
    CacheCorrupt(String),

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Embedding model mismatch: index built with {expected}, active model is {actual}")]
    ModelMismatch { expected: String, actual: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Corpus source error: {0}")]
    Source(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
