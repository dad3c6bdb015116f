use crate::provider::ProviderError;

/// Shared error type used across all Spindle crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage: {0}")]
    Storage(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("tool {name}: {message}")]
    Tool { name: String, message: String },

    #[error("config: {0}")]
    Config(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("subagent depth {depth} exceeds limit {max}")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
